//! Console control bridge.
//!
//! Routes Ctrl-C, Ctrl-Break, and console close/shutdown events into the
//! shared cancellation token so a recording finalizes instead of dying
//! with a half-written container.

use std::sync::OnceLock;

use tracing::info;
use windows::Win32::Foundation::BOOL;
use windows::Win32::System::Console::{
    SetConsoleCtrlHandler, CTRL_BREAK_EVENT, CTRL_CLOSE_EVENT, CTRL_C_EVENT, CTRL_SHUTDOWN_EVENT,
};

use crate::cancel::CancelToken;
use crate::error::CaptureError;

static CONSOLE_TOKEN: OnceLock<CancelToken> = OnceLock::new();

/// Install the process-wide console handler feeding `token`. Later calls
/// keep the token from the first installation.
pub fn install_console_handler(token: &CancelToken) -> Result<(), CaptureError> {
    let _ = CONSOLE_TOKEN.set(token.clone());
    // Safety: handler is a static function and the token it reads lives in
    // a process-wide static.
    unsafe { SetConsoleCtrlHandler(Some(console_handler), true) }.map_err(|e| {
        CaptureError::InitFailed {
            component: "console handler",
            detail: e.to_string(),
        }
    })
}

unsafe extern "system" fn console_handler(ctrl_type: u32) -> BOOL {
    match ctrl_type {
        CTRL_C_EVENT | CTRL_BREAK_EVENT | CTRL_CLOSE_EVENT | CTRL_SHUTDOWN_EVENT => {
            info!(ctrl_type, "console control event, stopping capture");
            if let Some(token) = CONSOLE_TOKEN.get() {
                token.cancel();
            }
            BOOL(1)
        }
        _ => BOOL(0),
    }
}
