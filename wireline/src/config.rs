/// Configuration for a [`Reactor`](crate::Reactor).
#[derive(Clone)]
pub struct ReactorConfig {
    /// Number of worker threads. 0 = number of CPUs.
    pub threads: usize,
    /// Capacity of the per-worker readiness batch buffer.
    pub event_batch: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig {
            threads: 1,
            event_batch: 256,
        }
    }
}

impl ReactorConfig {
    /// Set the number of worker threads. 0 = number of CPUs.
    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    /// Set the readiness batch buffer capacity.
    pub fn event_batch(mut self, n: usize) -> Self {
        self.event_batch = n;
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.event_batch == 0 {
            return Err(crate::error::Error::Setup(
                "event_batch must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Get the number of available CPU cores.
pub(crate) fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 {
        1
    } else {
        ret as usize
    }
}
