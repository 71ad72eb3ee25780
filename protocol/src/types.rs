use std::fmt;

/// Path of the terminal WebSocket endpoint
pub const TERMINAL_PATH: &str = "/terminal/ws";

/// WebSocket close codes sent by the server
pub mod close {
    /// The shell exited and the terminal is finished
    pub const NORMAL: u16 = 1000;
    /// Unknown session, inactive session, or wrong secret
    pub const POLICY: u16 = 1008;
    /// The shell could not be started
    pub const INTERNAL: u16 = 1011;
}

/// Dimensions of a pseudo-terminal, in character cells
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub const fn new(cols: u16, rows: u16) -> Self {
        TerminalSize { cols, rows }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        TerminalSize::new(80, 24)
    }
}

impl fmt::Display for TerminalSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Relative URL of the terminal connection for one session
pub fn terminal_url(session_id: &str, secret: &str) -> String {
    format!(
        "{}?sessionId={}&secret={}",
        TERMINAL_PATH, session_id, secret
    )
}

/// Final status line written to the terminal when its shell exits
///
/// Exit code zero gets a short notice; anything else reports the exit code
/// and the terminating signal, if there was one.
pub fn exit_banner(code: u32, signal: Option<&str>) -> String {
    if code == 0 {
        "\r\n[shell] session ended\r\n".to_string()
    } else {
        format!(
            "\r\n[shell] shell exited (code={}, signal={})\r\n",
            code,
            signal.unwrap_or("none")
        )
    }
}
