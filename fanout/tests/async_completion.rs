use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::thread;
use std::time::Duration;

use fanout::AsyncDispatcher;

/// A future that suspends exactly once, then completes after another
/// thread wakes it, exercising real continuation reentry rather than an
/// immediately-ready future.
struct SuspendOnce {
    ready: Arc<AtomicBool>,
    waker_slot: Arc<Mutex<Option<Waker>>>,
    polled_once: bool,
}

impl Future for SuspendOnce {
    type Output = ();
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.ready.load(Ordering::SeqCst) {
            return Poll::Ready(());
        }
        if !self.polled_once {
            self.polled_once = true;
            *self.waker_slot.lock().unwrap() = Some(cx.waker().clone());
            let ready = Arc::clone(&self.ready);
            let waker_slot = Arc::clone(&self.waker_slot);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                ready.store(true, Ordering::SeqCst);
                if let Some(waker) = waker_slot.lock().unwrap().take() {
                    waker.wake();
                }
            });
        }
        Poll::Pending
    }
}

struct NoopWaker;
impl Wake for NoopWaker {
    fn wake(self: Arc<Self>) {}
    fn wake_by_ref(self: &Arc<Self>) {}
}

#[test]
fn cycle_with_a_real_suspension_completes_once_woken() {
    let mut dispatcher = AsyncDispatcher::new(3).unwrap();
    let completed = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let completed = Arc::clone(&completed);
        dispatcher
            .add(move || {
                let completed = Arc::clone(&completed);
                let fut = SuspendOnce {
                    ready: Arc::new(AtomicBool::new(false)),
                    waker_slot: Arc::new(Mutex::new(None)),
                    polled_once: false,
                };
                async move {
                    fut.await;
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();
    }

    let mut future = dispatcher.execute_and_wait_async().unwrap();
    let waker = Waker::from(Arc::new(NoopWaker));
    let mut cx = Context::from_waker(&waker);

    // The futures haven't had time to fire their wake-up threads yet, so
    // the very first poll should observe Pending.
    let first_poll = Pin::new(&mut future).poll(&mut cx);
    assert!(matches!(first_poll, Poll::Pending));

    loop {
        match Pin::new(&mut future).poll(&mut cx) {
            Poll::Ready(result) => {
                result.unwrap();
                break;
            }
            Poll::Pending => thread::sleep(Duration::from_millis(5)),
        }
    }

    assert_eq!(completed.load(Ordering::SeqCst), 3);
    dispatcher.dispose().unwrap();
}

#[test]
fn blocking_consumer_pattern_completes_without_manual_polling() {
    let mut dispatcher = AsyncDispatcher::new(2).unwrap();
    let completed = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let completed = Arc::clone(&completed);
        dispatcher
            .add(move || {
                let completed = Arc::clone(&completed);
                async move {
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();
    }

    dispatcher.execute_and_wait_blocking().unwrap();
    assert_eq!(completed.load(Ordering::SeqCst), 2);
    dispatcher.dispose().unwrap();
}
