use tokio::sync::Notify;

/// Parks on `notify` until `check` yields a value.
///
/// The notification is enabled before `check` runs, so a producer that changes
/// state and calls [`Notify::notify_waiters`] between the check and the await
/// still wakes this waiter. Spurious wakeups re-run the check.
///
/// ```rust
/// use dmxcore::utils::wait_until;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use tokio::sync::Notify;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let notify = Notify::new();
/// let ready = AtomicBool::new(true);
/// let value = wait_until(&notify, || ready.load(Ordering::Acquire).then_some(7)).await;
/// assert_eq!(value, 7);
/// # }
/// ```
pub async fn wait_until<T, F>(notify: &Notify, mut check: F) -> T
where
    F: FnMut() -> Option<T>,
{
    loop {
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(value) = check() {
            return value;
        }

        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wakes_on_notify() {
        let notify = Arc::new(Notify::new());
        let slot = Arc::new(Mutex::new(None::<u32>));

        let producer = {
            let notify = notify.clone();
            let slot = slot.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                *slot.lock() = Some(42);
                notify.notify_waiters();
            })
        };

        let value = wait_until(&notify, || *slot.lock()).await;
        assert_eq!(value, 42);
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_until_ready() {
        let notify = Notify::new();
        let mut waiter = tokio_test::task::spawn(wait_until(&notify, || None::<()>));
        tokio_test::assert_pending!(waiter.poll());
        notify.notify_waiters();
        assert!(waiter.is_woken());
        tokio_test::assert_pending!(waiter.poll());
    }
}
