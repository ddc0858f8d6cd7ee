use std::time::Duration;

// Knobs the embedding CLI can set. Defaults match the plain debug-server
// behavior: target reads EOF from stdin, writes land on the server's own
// stdout/stderr.
#[derive(Clone)]
pub struct Settings {
    // Fed to the target as stdin; None means /dev/null.
    pub stdin_file: Option<String>,
    // Target's stdout/stderr; None means inherit the server's.
    pub stdout_file: Option<String>,
    pub stderr_file: Option<String>,
    // How often the wait loop checks the control plane during a long continue.
    pub wait_poll_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            stdin_file: None,
            stdout_file: None,
            stderr_file: None,
            wait_poll_interval: Duration::from_millis(1),
        }
    }
}
