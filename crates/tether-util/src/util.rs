pub mod timeout {
    use std::time::Duration;
    use tokio::time::timeout;

    /// `None` when `duration` elapses first.
    pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Option<T>
    where
        F: std::future::Future<Output = T>,
    {
        timeout(duration, future).await.ok()
    }

    pub fn duration_ms(duration: Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }
}

pub mod defer {
    /// Runs the closure when dropped, including when the owning future is
    /// cancelled mid-await.
    pub struct Defer<F: FnOnce()> {
        f: Option<F>,
    }

    impl<F: FnOnce()> Defer<F> {
        pub fn new(f: F) -> Self {
            Self { f: Some(f) }
        }

        /// Drops the closure without running it.
        pub fn dismiss(mut self) {
            self.f = None;
        }
    }

    impl<F: FnOnce()> Drop for Defer<F> {
        fn drop(&mut self) {
            if let Some(f) = self.f.take() {
                f();
            }
        }
    }
}
