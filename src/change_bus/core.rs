use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    thread::{self, JoinHandle, ThreadId},
};

use tracing::{error, trace};
use uuid::Uuid;

use super::event::ChangeEvent;

/// 观察者回调：返回错误或 panic 都只影响自己，不会阻断其他观察者。
pub type ChangeHandler = Arc<dyn Fn(&[ChangeEvent]) -> Result<(), String> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

type Subscribers = Arc<Mutex<Vec<(SubscriptionId, ChangeHandler)>>>;

enum BusMessage {
    Publish(Vec<ChangeEvent>),
    Flush(Sender<()>),
    Shutdown,
}

/// 变更事件总线：发布方只把批次放进队列，由唯一的投递线程按发布顺序分发。
/// 观察者因此永远不会并发收到事件；进程退出时未投递的事件直接丢弃。
#[derive(Clone)]
pub struct ChangeBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    sender: Sender<BusMessage>,
    subscribers: Subscribers,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl ChangeBus {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        let worker_subscribers = subscribers.clone();
        let worker = thread::spawn(move || deliver_loop(receiver, worker_subscribers));
        let worker_id = worker.thread().id();
        Self {
            inner: Arc::new(BusInner {
                sender,
                subscribers,
                worker: Mutex::new(Some(worker)),
                worker_id,
            }),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&[ChangeEvent]) -> Result<(), String> + Send + Sync + 'static,
    {
        let id = SubscriptionId(Uuid::new_v4());
        let mut subs = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        subs.push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let before = subs.len();
        subs.retain(|(existing, _)| *existing != id);
        subs.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .map(|subs| subs.len())
            .unwrap_or_default()
    }

    /// 非阻塞发布一个批次；空批次直接忽略。
    pub fn publish(&self, batch: Vec<ChangeEvent>) {
        if batch.is_empty() {
            return;
        }
        if self.inner.sender.send(BusMessage::Publish(batch)).is_err() {
            error!("change bus delivery thread is gone, dropping batch");
        }
    }

    /// 阻塞直到此前发布的批次全部投递完毕；在投递线程内调用时立即返回。
    pub fn flush(&self) {
        if thread::current().id() == self.inner.worker_id {
            return;
        }
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.inner.sender.send(BusMessage::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        let _ = self.sender.send(BusMessage::Shutdown);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = worker {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn deliver_loop(receiver: Receiver<BusMessage>, subscribers: Subscribers) {
    for message in receiver {
        match message {
            BusMessage::Publish(batch) => {
                // 订阅者快照：投递期间新注册的观察者不会收到这一批。
                let snapshot: Vec<(SubscriptionId, ChangeHandler)> = subscribers
                    .lock()
                    .map(|subs| subs.clone())
                    .unwrap_or_else(|p| p.into_inner().clone());
                trace!(events = batch.len(), observers = snapshot.len(), "dispatching batch");
                for (id, handler) in snapshot {
                    match panic::catch_unwind(AssertUnwindSafe(|| handler(&batch))) {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            error!(subscription = ?id, error = %err, "change observer failed");
                        }
                        Err(_) => {
                            error!(subscription = ?id, "change observer panicked");
                        }
                    }
                }
            }
            BusMessage::Flush(ack) => {
                let _ = ack.send(());
            }
            BusMessage::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_bus::event::ChangeKind;

    fn event(kind: ChangeKind, server_url: &str) -> ChangeEvent {
        ChangeEvent::new(kind, "a", server_url).unwrap()
    }

    #[test]
    fn delivers_in_publish_order() {
        let bus = ChangeBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(move |batch| {
            sink.lock().unwrap().extend(batch.iter().map(|e| e.server_url.clone()));
            Ok(())
        });
        for i in 0..50 {
            bus.publish(vec![event(ChangeKind::Created, &format!("/{i}"))]);
        }
        bus.flush();
        let expected: Vec<String> = (0..50).map(|i| format!("/{i}")).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
    }

    #[test]
    fn failing_observer_does_not_block_others() {
        let bus = ChangeBus::new();
        let count = Arc::new(Mutex::new(0));
        bus.subscribe(|_| Err("boom".to_string()));
        bus.subscribe(|_| panic!("observer bug"));
        let counter = count.clone();
        bus.subscribe(move |batch| {
            *counter.lock().unwrap() += batch.len();
            Ok(())
        });
        bus.publish(vec![event(ChangeKind::Deleted, "/x")]);
        bus.publish(vec![event(ChangeKind::Deleted, "/y")]);
        bus.flush();
        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[test]
    fn observer_registered_during_dispatch_misses_in_flight_batch() {
        let bus = ChangeBus::new();
        let late_seen = Arc::new(Mutex::new(Vec::new()));
        let registering_bus = bus.clone();
        let late_sink = late_seen.clone();
        let registered = Arc::new(Mutex::new(false));
        let flag = registered.clone();
        bus.subscribe(move |_| {
            let mut done = flag.lock().unwrap();
            if !*done {
                *done = true;
                let sink = late_sink.clone();
                registering_bus.subscribe(move |batch| {
                    sink.lock().unwrap().extend(batch.iter().map(|e| e.server_url.clone()));
                    Ok(())
                });
            }
            Ok(())
        });
        bus.publish(vec![event(ChangeKind::Created, "/first")]);
        bus.publish(vec![event(ChangeKind::Created, "/second")]);
        bus.flush();
        assert_eq!(*late_seen.lock().unwrap(), vec!["/second".to_string()]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = ChangeBus::new();
        let count = Arc::new(Mutex::new(0));
        let counter = count.clone();
        let id = bus.subscribe(move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });
        bus.publish(vec![event(ChangeKind::Created, "/a")]);
        bus.flush();
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(vec![event(ChangeKind::Created, "/b")]);
        bus.flush();
        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn empty_batches_are_not_delivered() {
        let bus = ChangeBus::new();
        let count = Arc::new(Mutex::new(0));
        let counter = count.clone();
        bus.subscribe(move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });
        bus.publish(Vec::new());
        bus.flush();
        assert_eq!(*count.lock().unwrap(), 0);
    }
}
