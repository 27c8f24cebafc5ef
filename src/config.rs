use std::time::Duration;

/// The receive buffer size used by the legacy RMI multiplexer.
pub const DEFAULT_RECEIVE_BUFFER: usize = 2048;

/// Settings applied to every sub-connection of a `Multiplexer`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    receive_buffer: usize,
    read_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            receive_buffer: DEFAULT_RECEIVE_BUFFER,
            read_timeout: None,
        }
    }
}

impl Config {
    /// Sets the capacity of each sub-connection's receive buffer.
    ///
    /// ## Panics
    ///
    /// This function panics if `sz` is zero or does not fit a frame's `u32` count.
    pub fn receive_buffer(mut self, sz: usize) -> Config {
        assert!(sz > 0, "receive buffer capacity must be non-zero");
        assert!(sz as u64 <= u64::from(u32::max_value()), "receive buffer capacity too large");
        self.receive_buffer = sz;
        self
    }

    /// Bounds how long a read waits for data. Reads block indefinitely by default.
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Config {
        self.read_timeout = timeout;
        self
    }

    pub fn receive_buffer_size(&self) -> usize {
        self.receive_buffer
    }

    pub fn read_timeout_duration(&self) -> Option<Duration> {
        self.read_timeout
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.receive_buffer_size(), DEFAULT_RECEIVE_BUFFER);
        assert_eq!(config.read_timeout_duration(), None);
    }

    #[test]
    fn setters_chain() {
        let config = Config::default()
            .receive_buffer(16)
            .read_timeout(Some(Duration::from_millis(5)));
        assert_eq!(config.receive_buffer_size(), 16);
        assert_eq!(config.read_timeout_duration(), Some(Duration::from_millis(5)));
    }

    #[test]
    #[should_panic]
    fn zero_buffer_rejected() {
        Config::default().receive_buffer(0);
    }
}
