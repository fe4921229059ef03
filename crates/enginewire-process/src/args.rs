use std::fmt::Display;

/// Builds a `--flag value` argument vector.
///
/// Values whose text is empty are skipped entirely, together with their flag.
/// Values are passed as separate arguments, so no quoting is ever needed.
#[derive(Debug, Default, Clone)]
pub struct ArgsBuilder {
    args: Vec<String>,
}

impl ArgsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&mut self, flag: &str, value: impl Display) -> &mut Self {
        let value = value.to_string();
        if !value.is_empty() {
            self.args.push(format!("--{flag}"));
            self.args.push(value);
        }
        self
    }

    pub fn value_opt<T: Display>(&mut self, flag: &str, value: Option<T>) -> &mut Self {
        if let Some(value) = value {
            self.value(flag, value);
        }
        self
    }

    /// `--flag value` only when `value` differs from `default`.
    pub fn non_default<T: Display + PartialEq>(
        &mut self,
        flag: &str,
        value: T,
        default: T,
    ) -> &mut Self {
        if value != default {
            self.value(flag, value);
        }
        self
    }

    /// Bare `--flag` when `on`.
    pub fn switch(&mut self, flag: &str, on: bool) -> &mut Self {
        if on {
            self.args.push(format!("--{flag}"));
        }
        self
    }

    /// Comma-joined list; skipped when empty.
    pub fn list<S: AsRef<str>>(&mut self, flag: &str, values: &[S]) -> &mut Self {
        let joined = values
            .iter()
            .map(AsRef::as_ref)
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>()
            .join(",");
        self.value(flag, joined)
    }

    pub fn build(&self) -> Vec<String> {
        self.args.clone()
    }

    pub fn into_args(self) -> Vec<String> {
        self.args
    }
}
