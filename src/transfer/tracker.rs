use std::{
    collections::VecDeque,
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use dashmap::{mapref::entry::Entry, DashMap};
use tracing::{debug, warn};

use crate::change_bus::{ChangeBus, ChangeKind, SubscriptionId};
use crate::db::current_timestamp_millis;

#[flutter_rust_bridge::frb]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Upload,
    Download,
}

/// 传输协作者上报的一次进度。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressTick {
    pub oc_id: String,
    pub oc_id_transfer: String,
    pub bytes_sent: u64,
    pub bytes_expected: u64,
    pub chunk: u32,
    pub session_kind: SessionKind,
}

/// 以 `(oc_id, oc_id_transfer)` 为键的传输进度；`bytes_sent` 只增不减。
#[flutter_rust_bridge::frb]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferProgress {
    pub oc_id: String,
    pub oc_id_transfer: String,
    pub bytes_sent: u64,
    pub bytes_expected: u64,
    pub chunk_index: u32,
    pub session_kind: SessionKind,
    pub updated_at_millis: i64,
}

impl TransferProgress {
    /// 0.0 - 1.0；预期大小未知时返回 None。
    pub fn fraction(&self) -> Option<f64> {
        if self.bytes_expected == 0 {
            return None;
        }
        Some((self.bytes_sent as f64 / self.bytes_expected as f64).min(1.0))
    }
}

/// 推送给订阅者的增量，附带瞬时速度。
#[derive(Clone, Debug, PartialEq)]
pub struct TransferUpdate {
    pub progress: TransferProgress,
    pub speed_bps: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct TransferKey {
    oc_id: String,
    oc_id_transfer: String,
}

/// 保留的终态标记上限；超出后最早的标记被淘汰。
const TERMINATED_CAPACITY: usize = 256;

/// 已结束的传输；`oc_id_transfer` 为 None 时覆盖该 ocId 的全部传输。
#[derive(Clone, Debug, PartialEq, Eq)]
struct Terminated {
    oc_id: String,
    oc_id_transfer: Option<String>,
}

impl Terminated {
    fn covers(&self, key: &TransferKey) -> bool {
        self.oc_id == key.oc_id
            && self
                .oc_id_transfer
                .as_deref()
                .map_or(true, |id| id == key.oc_id_transfer)
    }
}

/// 最近一次用来计算速度的快照（字节数 + 时间）。
#[derive(Clone)]
struct SpeedSample {
    bytes: u64,
    instant: Instant,
}

struct Tracked {
    progress: TransferProgress,
    sample: SpeedSample,
}

/// 进行中传输的进度表。
/// 分片加锁：不同传输的并发上报互不阻塞；完成语义由 ChangeBus 上的终态事件决定。
#[derive(Clone, Default)]
pub struct TransferTracker {
    entries: Arc<DashMap<TransferKey, Tracked>>,
    terminated: Arc<Mutex<VecDeque<Terminated>>>,
    subscribers: Arc<Mutex<Vec<Sender<TransferUpdate>>>>,
}

impl TransferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次进度；回退的 tick 与已结束传输的迟到 tick 被丢弃并返回 false。
    pub fn record(&self, tick: ProgressTick) -> bool {
        if tick.oc_id.is_empty() {
            warn!("dropping progress tick without ocId");
            return false;
        }
        let key = TransferKey {
            oc_id: tick.oc_id.clone(),
            oc_id_transfer: tick.oc_id_transfer.clone(),
        };
        if self.is_terminated(&key) {
            debug!(oc_id = %key.oc_id, oc_id_transfer = %key.oc_id_transfer, "dropping tick for finished transfer");
            return false;
        }
        let now = Instant::now();
        let update = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let tracked = occupied.get_mut();
                if tick.bytes_sent < tracked.progress.bytes_sent {
                    warn!(
                        oc_id = %tick.oc_id,
                        oc_id_transfer = %tick.oc_id_transfer,
                        stored = tracked.progress.bytes_sent,
                        received = tick.bytes_sent,
                        "dropping regressed progress tick"
                    );
                    return false;
                }
                let speed_bps = speed_between(&tracked.sample, tick.bytes_sent, now);
                tracked.progress = progress_from_tick(tick);
                tracked.sample = SpeedSample {
                    bytes: tracked.progress.bytes_sent,
                    instant: now,
                };
                TransferUpdate {
                    progress: tracked.progress.clone(),
                    speed_bps,
                }
            }
            Entry::Vacant(vacant) => {
                let progress = progress_from_tick(tick);
                let tracked = vacant.insert(Tracked {
                    sample: SpeedSample {
                        bytes: progress.bytes_sent,
                        instant: now,
                    },
                    progress,
                });
                TransferUpdate {
                    progress: tracked.progress.clone(),
                    speed_bps: None,
                }
            }
        };
        // 终态标记先于清理写入，插入后再检查一次即可覆盖与 observe 的竞争。
        if self.is_terminated(&key) {
            self.entries.remove(&key);
            return false;
        }
        self.broadcast(update);
        true
    }

    pub fn get_all(&self) -> Vec<TransferProgress> {
        let mut all: Vec<TransferProgress> = self
            .entries
            .iter()
            .map(|entry| entry.value().progress.clone())
            .collect();
        all.sort_by(|a, b| {
            a.oc_id
                .cmp(&b.oc_id)
                .then_with(|| a.oc_id_transfer.cmp(&b.oc_id_transfer))
        });
        all
    }

    /// 某个 ocId 最近更新的一条传输进度。
    pub fn progress(&self, oc_id: &str) -> Option<TransferProgress> {
        self.entries
            .iter()
            .filter(|entry| entry.key().oc_id == oc_id)
            .map(|entry| entry.value().progress.clone())
            .max_by_key(|progress| progress.updated_at_millis)
    }

    /// 移除某个 ocId 的进度；指定 `oc_id_transfer` 时只移除对应那一条。
    pub fn evict(&self, oc_id: &str, oc_id_transfer: Option<&str>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| {
            let same_item = key.oc_id == oc_id;
            let same_transfer = oc_id_transfer.map_or(true, |id| key.oc_id_transfer == id);
            !(same_item && same_transfer)
        });
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(oc_id, removed, "transfer progress evicted");
        }
        removed
    }

    /// 标记传输已结束并清理进度；之后到达的同一传输的 tick 会被丢弃。
    pub fn finish(&self, oc_id: &str, oc_id_transfer: Option<&str>) -> usize {
        {
            let mut terminated = self.lock_terminated();
            terminated.push_back(Terminated {
                oc_id: oc_id.to_string(),
                oc_id_transfer: oc_id_transfer.map(str::to_string),
            });
            while terminated.len() > TERMINATED_CAPACITY {
                terminated.pop_front();
            }
        }
        self.evict(oc_id, oc_id_transfer)
    }

    /// 同一 ocId 重新开始传输时撤销旧的终态标记。
    fn restart(&self, oc_id: &str, oc_id_transfer: Option<&str>) {
        self.lock_terminated().retain(|mark| {
            let same_transfer = match (oc_id_transfer, mark.oc_id_transfer.as_deref()) {
                (Some(started), Some(ended)) => started == ended,
                _ => true,
            };
            !(mark.oc_id == oc_id && same_transfer)
        });
    }

    /// 注册 ChangeBus 观察者：终态事件清理对应进度，开始事件解除旧的终态标记。
    pub fn observe(&self, bus: &ChangeBus) -> SubscriptionId {
        let tracker = self.clone();
        bus.subscribe(move |batch| {
            for event in batch.iter().filter(|event| event.kind.is_transfer()) {
                let Some(oc_id) = event.oc_id.as_deref() else {
                    continue;
                };
                let oc_id_transfer = event.oc_id_transfer.as_deref();
                match event.kind {
                    ChangeKind::DownloadStarted | ChangeKind::UploadStarted => {
                        tracker.restart(oc_id, oc_id_transfer)
                    }
                    _ => {
                        tracker.finish(oc_id, oc_id_transfer);
                    }
                }
            }
            Ok(())
        })
    }

    /// 在后台线程中持续消费外部传输协作者的进度流，发送端关闭后线程退出。
    pub fn pump(&self, source: Receiver<ProgressTick>) -> JoinHandle<()> {
        let tracker = self.clone();
        thread::spawn(move || {
            for tick in source {
                tracker.record(tick);
            }
        })
    }

    /// 提供一个新的 channel 接收器，订阅时先回放当前全部进度。
    pub fn subscribe(&self) -> Receiver<TransferUpdate> {
        let (tx, rx) = mpsc::channel();
        for progress in self.get_all() {
            let _ = tx.send(TransferUpdate {
                progress,
                speed_bps: None,
            });
        }
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    fn is_terminated(&self, key: &TransferKey) -> bool {
        self.lock_terminated().iter().any(|mark| mark.covers(key))
    }

    fn lock_terminated(&self) -> std::sync::MutexGuard<'_, VecDeque<Terminated>> {
        self.terminated.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn broadcast(&self, update: TransferUpdate) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain_mut(|sender| sender.send(update.clone()).is_ok());
        }
    }
}

fn progress_from_tick(tick: ProgressTick) -> TransferProgress {
    TransferProgress {
        oc_id: tick.oc_id,
        oc_id_transfer: tick.oc_id_transfer,
        bytes_sent: tick.bytes_sent,
        bytes_expected: tick.bytes_expected,
        chunk_index: tick.chunk,
        session_kind: tick.session_kind,
        updated_at_millis: current_timestamp_millis(),
    }
}

fn speed_between(previous: &SpeedSample, bytes: u64, now: Instant) -> Option<f64> {
    let delta_bytes = bytes.saturating_sub(previous.bytes);
    let elapsed = now.duration_since(previous.instant).as_secs_f64();
    if delta_bytes > 0 && elapsed > 0.0 {
        return Some(delta_bytes as f64 / elapsed);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_bus::{ChangeEvent, ChangeKind};
    use std::time::Duration;

    fn tick(oc_id: &str, transfer: &str, bytes_sent: u64) -> ProgressTick {
        ProgressTick {
            oc_id: oc_id.to_string(),
            oc_id_transfer: transfer.to_string(),
            bytes_sent,
            bytes_expected: 100,
            chunk: 0,
            session_kind: SessionKind::Upload,
        }
    }

    #[test]
    fn regressed_ticks_are_dropped() {
        let tracker = TransferTracker::new();
        let mut observed = Vec::new();
        for bytes in [10, 30, 20, 50] {
            tracker.record(tick("1", "t1", bytes));
            observed.push(tracker.progress("1").unwrap().bytes_sent);
        }
        assert_eq!(observed, vec![10, 30, 30, 50]);
        assert!(!tracker.record(tick("1", "t1", 5)));
    }

    #[test]
    fn keys_are_independent() {
        let tracker = TransferTracker::new();
        assert!(tracker.record(tick("1", "t1", 40)));
        assert!(tracker.record(tick("1", "t2", 10)));
        assert!(tracker.record(tick("2", "t3", 70)));
        let all = tracker.get_all();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].oc_id_transfer, "t1");
        assert_eq!(all[2].fraction(), Some(0.7));
    }

    #[test]
    fn terminal_event_evicts_matching_entry() {
        let bus = ChangeBus::new();
        let tracker = TransferTracker::new();
        tracker.observe(&bus);
        tracker.record(tick("1", "t1", 10));
        tracker.record(tick("1", "t2", 10));
        tracker.record(tick("2", "t3", 10));

        bus.publish(vec![
            ChangeEvent::transfer(ChangeKind::UploadStarted, "a", "/docs", "2", None).unwrap(),
            ChangeEvent::transfer(ChangeKind::UploadFinished, "a", "/docs", "1", Some("t1")).unwrap(),
        ]);
        bus.flush();

        let keys: Vec<_> = tracker
            .get_all()
            .into_iter()
            .map(|p| (p.oc_id, p.oc_id_transfer))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("1".to_string(), "t2".to_string()),
                ("2".to_string(), "t3".to_string())
            ]
        );

        bus.publish(vec![ChangeEvent::transfer(
            ChangeKind::DownloadCancelled,
            "a",
            "/docs",
            "1",
            None,
        )
        .unwrap()]);
        bus.flush();
        assert!(tracker.progress("1").is_none());
    }

    #[test]
    fn late_tick_after_terminal_event_is_dropped() {
        let bus = ChangeBus::new();
        let tracker = TransferTracker::new();
        tracker.observe(&bus);
        assert!(tracker.record(tick("1", "t1", 90)));

        bus.publish(vec![
            ChangeEvent::transfer(ChangeKind::UploadFinished, "a", "/docs", "1", Some("t1")).unwrap(),
        ]);
        bus.flush();

        assert!(!tracker.record(tick("1", "t1", 80)));
        assert!(!tracker.record(tick("1", "t1", 100)));
        assert!(tracker.get_all().is_empty());
        assert!(tracker.progress("1").is_none());
        // 同一文件的新传输不受影响。
        assert!(tracker.record(tick("1", "t2", 10)));
    }

    #[test]
    fn restarted_transfer_accepts_ticks_again() {
        let bus = ChangeBus::new();
        let tracker = TransferTracker::new();
        tracker.observe(&bus);
        tracker.record(tick("1", "t1", 50));

        bus.publish(vec![
            ChangeEvent::transfer(ChangeKind::DownloadCancelled, "a", "/docs", "1", None).unwrap(),
        ]);
        bus.flush();
        assert!(!tracker.record(tick("1", "t1", 60)));

        bus.publish(vec![
            ChangeEvent::transfer(ChangeKind::DownloadStarted, "a", "/docs", "1", Some("t1")).unwrap(),
        ]);
        bus.flush();
        assert!(tracker.record(tick("1", "t1", 5)));
        assert_eq!(tracker.progress("1").unwrap().bytes_sent, 5);
    }

    #[test]
    fn terminal_marks_are_bounded() {
        let tracker = TransferTracker::new();
        for i in 0..TERMINATED_CAPACITY + 10 {
            tracker.finish(&format!("{i}"), Some("t"));
        }
        assert_eq!(tracker.lock_terminated().len(), TERMINATED_CAPACITY);
        assert!(tracker.record(tick("0", "t", 1)));
        assert!(!tracker.record(tick(&format!("{}", TERMINATED_CAPACITY), "t", 1)));
    }

    #[test]
    fn subscribers_get_replay_and_speed() {
        let tracker = TransferTracker::new();
        tracker.record(tick("1", "t1", 10));
        let updates = tracker.subscribe();
        let replay = updates.recv().unwrap();
        assert_eq!(replay.progress.bytes_sent, 10);
        assert!(replay.speed_bps.is_none());

        thread::sleep(Duration::from_millis(5));
        tracker.record(tick("1", "t1", 60));
        let live = updates.recv().unwrap();
        assert_eq!(live.progress.bytes_sent, 60);
        assert!(live.speed_bps.unwrap() > 0.0);
    }

    #[test]
    fn pump_drains_source_until_closed() {
        let tracker = TransferTracker::new();
        let (tx, rx) = mpsc::channel();
        let worker = tracker.pump(rx);
        for bytes in [5, 15, 25] {
            tx.send(tick("9", "t", bytes)).unwrap();
        }
        drop(tx);
        worker.join().unwrap();
        assert_eq!(tracker.progress("9").unwrap().bytes_sent, 25);
    }

    #[test]
    fn concurrent_records_for_distinct_keys() {
        let tracker = TransferTracker::new();
        let workers: Vec<_> = (0..8)
            .map(|i| {
                let tracker = tracker.clone();
                thread::spawn(move || {
                    for bytes in 0..50 {
                        tracker.record(tick(&format!("{i}"), "t", bytes));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        let all = tracker.get_all();
        assert_eq!(all.len(), 8);
        assert!(all.iter().all(|p| p.bytes_sent == 49));
    }
}
