//! Windows named pipes under `\\.\pipe\`.
//!
//! The server keeps one unconnected instance pending at all times so a client
//! that dials between two `accept` calls finds an instance instead of
//! `ERROR_FILE_NOT_FOUND`.

use std::fs::{File, OpenOptions};
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::sync::Mutex;

use tracing::{debug, info};
use windows_sys::Win32::Foundation::{ERROR_PIPE_CONNECTED, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::Storage::FileSystem::PIPE_ACCESS_DUPLEX;
use windows_sys::Win32::System::IO::CancelIoEx;
use windows_sys::Win32::System::Pipes::{
    ConnectNamedPipe, CreateNamedPipeW, DisconnectNamedPipe, PIPE_READMODE_BYTE,
    PIPE_REJECT_REMOTE_CLIENTS, PIPE_TYPE_BYTE, PIPE_UNLIMITED_INSTANCES, PIPE_WAIT,
};

use crate::stream::IpcStream;

const PIPE_BUFFER_SIZE: u32 = 64 * 1024;

fn pipe_path(name: &str) -> String {
    format!(r"\\.\pipe\{name}")
}

fn wide(s: &str) -> Vec<u16> {
    std::ffi::OsStr::new(s)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

fn create_instance(path: &[u16]) -> std::io::Result<OwnedHandle> {
    // SAFETY: `path` is a NUL-terminated UTF-16 string that outlives the call;
    // a null security-attributes pointer selects the default descriptor.
    let handle = unsafe {
        CreateNamedPipeW(
            path.as_ptr(),
            PIPE_ACCESS_DUPLEX,
            PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT | PIPE_REJECT_REMOTE_CLIENTS,
            PIPE_UNLIMITED_INSTANCES,
            PIPE_BUFFER_SIZE,
            PIPE_BUFFER_SIZE,
            0,
            std::ptr::null(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: `handle` is a freshly created, valid pipe handle we exclusively own.
    Ok(unsafe { OwnedHandle::from_raw_handle(handle as _) })
}

/// Server side of a named pipe.
pub struct PipeListener {
    name: String,
    path: Vec<u16>,
    pending: Mutex<Option<OwnedHandle>>,
}

impl PipeListener {
    pub fn bind(name: &str) -> std::io::Result<Self> {
        let path = wide(&pipe_path(name));
        let first = create_instance(&path)?;
        info!(pipe = %pipe_path(name), "listening on named pipe");
        Ok(Self {
            name: name.to_string(),
            path,
            pending: Mutex::new(Some(first)),
        })
    }

    /// Wait for a client on the pending instance, then queue the next one.
    pub fn accept(&self) -> std::io::Result<IpcStream> {
        let instance = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| std::io::Error::other("pipe listener lock poisoned"))?;
            match pending.take() {
                Some(handle) => handle,
                None => create_instance(&self.path)?,
            }
        };

        // SAFETY: `instance` is a valid pipe handle; a null OVERLAPPED means a
        // synchronous wait.
        let ok = unsafe { ConnectNamedPipe(instance.as_raw_handle() as HANDLE, std::ptr::null_mut()) };
        if ok == 0 {
            let err = std::io::Error::last_os_error();
            // The client connected between create and connect; that is success.
            if err.raw_os_error() != Some(ERROR_PIPE_CONNECTED as i32) {
                return Err(err);
            }
        }

        if let Ok(next) = create_instance(&self.path) {
            if let Ok(mut pending) = self.pending.lock() {
                *pending = Some(next);
            }
        }

        debug!(pipe = %self.name, "accepted named pipe client");
        Ok(IpcStream::from_pipe(File::from(instance)))
    }
}

pub(crate) fn connect(name: &str) -> std::io::Result<IpcStream> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(pipe_path(name))?;
    Ok(IpcStream::from_pipe(file))
}

/// Cancel blocked I/O on the handle and drop the connection.
///
/// `DisconnectNamedPipe` fails on client handles; that failure is expected.
pub(crate) fn disconnect(file: &File) {
    let handle = file.as_raw_handle() as HANDLE;
    // SAFETY: `handle` stays valid for the duration of both calls because
    // `file` is borrowed; a null OVERLAPPED cancels every pending operation.
    unsafe {
        CancelIoEx(handle, std::ptr::null());
        DisconnectNamedPipe(handle);
    }
}
