use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;

/// Handle to a one-shot timer task. Stopping (or dropping) the handle
/// prevents the timer from firing; a stop racing the firing is resolved
/// by the timer task checking the done channel first.
pub struct TimerHandle {
    stop: Option<oneshot::Sender<()>>,
}

impl TimerHandle {
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run `action` once after `delay` unless the handle is stopped first
pub fn one_shot<F, Fut>(delay: Duration, action: F) -> TimerHandle
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        tokio::select! {
            biased;

            _ = &mut stop_rx => {}
            _ = tokio::time::sleep(delay) => action().await,
        }
    });

    TimerHandle { stop: Some(stop_tx) }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        let _handle = one_shot(Duration::from_millis(50), move || async move {
            flag.store(true, Ordering::Release);
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;

        assert!(fired.load(Ordering::Acquire));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_firing() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        let mut handle = one_shot(Duration::from_millis(50), move || async move {
            flag.store(true, Ordering::Release);
        });

        handle.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;

        assert!(!fired.load(Ordering::Acquire));
    }
}
