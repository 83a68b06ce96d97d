//! The operations façade.
//!
//! Batch command semantics on top of [`Store`], including the multi-key
//! locking protocol and the notification fan-out. Each operation takes the
//! mode gate shared (except `SHOW`, which goes through the exclusive
//! [`Store::for_each`]), then the distinct buckets it touches in ascending
//! index order.

use std::io::{self, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::channel::PipeHandle;
use crate::notify::Notifier;
use crate::store::{Store, SubscriberSet, release_buckets};
use crate::wire::{KVS_ERROR, KVS_MISSING};

/// Maximum number of pairs accepted by one batch command.
pub const MAX_BATCH: usize = 256;

/// The operations façade shared by job workers and session workers.
#[derive(Debug)]
pub struct Kvs {
    store: Arc<Store>,
    notifier: Notifier,
}

impl Kvs {
    /// Wraps `store` together with a notifier.
    pub fn new(store: Arc<Store>) -> Kvs {
        Kvs {
            store,
            notifier: Notifier::new(),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// `WRITE` — upserts every pair, then notifies each distinct key once
    /// with the value a subsequent `get` would return. When a batch carries
    /// the same key twice, the later pair wins.
    pub fn write(&self, pairs: &[(String, String)]) {
        if pairs.is_empty() {
            return;
        }
        let _gate = self.store.gate_shared();
        let plan = Store::lock_plan(pairs.iter().map(|(key, _)| key.as_str()));
        let mut buckets = self.store.write_buckets(&plan);

        for (key, value) in pairs {
            buckets[slot(&plan, key)].put(key, value);
        }

        // Fan out while the bucket locks are still held; that is what
        // serializes per-sink delivery with the commit order on each key.
        let mut notified: Vec<&str> = Vec::with_capacity(pairs.len());
        for (key, _) in pairs {
            if notified.contains(&key.as_str()) {
                continue;
            }
            notified.push(key);
            if let Some((value, subscribers)) = buckets[slot(&plan, key)].value_and_subscribers(key)
            {
                self.notifier.publish_update(subscribers, key, value);
            }
        }
        release_buckets(buckets);
    }

    /// `READ` — prints `(key,value)` groups for every requested key in
    /// lexicographic order, with [`KVS_ERROR`] standing in for missing keys.
    /// An empty batch still prints the brackets.
    pub fn read(&self, keys: &[String], out: &mut dyn Write) -> io::Result<()> {
        let _gate = self.store.gate_shared();
        let mut sorted: Vec<&str> = keys.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        let plan = Store::lock_plan(sorted.iter().copied());
        let buckets = self.store.read_buckets(&plan);

        out.write_all(b"[")?;
        for key in &sorted {
            match buckets[slot(&plan, key)].get(key) {
                Some(value) => write!(out, "({key},{value})")?,
                None => write!(out, "({key},{KVS_ERROR})")?,
            }
        }
        out.write_all(b"]\n")?;
        release_buckets(buckets);
        Ok(())
    }

    /// `DELETE` — removes every present key; missing keys are reported as
    /// `(key,KVSMISSING)` inside brackets, and nothing is printed when every
    /// key existed. Each removed entry's former subscribers receive a
    /// `DELETED` notification after the bucket locks are released.
    pub fn delete(&self, keys: &[String], out: &mut dyn Write) -> io::Result<()> {
        let gate = self.store.gate_shared();
        let mut sorted: Vec<&str> = keys.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        let plan = Store::lock_plan(sorted.iter().copied());
        let mut buckets = self.store.write_buckets(&plan);

        let mut removed: Vec<(String, SubscriberSet)> = Vec::new();
        let mut missing_any = false;
        for key in &sorted {
            match buckets[slot(&plan, key)].remove(key) {
                Some(subscribers) => removed.push((key.to_string(), subscribers)),
                None => {
                    if !missing_any {
                        out.write_all(b"[")?;
                        missing_any = true;
                    }
                    write!(out, "({key},{KVS_MISSING})")?;
                }
            }
        }
        if missing_any {
            out.write_all(b"]\n")?;
        }

        release_buckets(buckets);
        drop(gate);
        for (key, subscribers) in removed {
            self.notifier.publish_delete(&subscribers, &key);
        }
        Ok(())
    }

    /// `SHOW` — one `(key, value)` line per pair, from a single consistent
    /// snapshot of the whole table.
    pub fn show(&self, out: &mut dyn Write) -> io::Result<()> {
        let mut result = Ok(());
        self.store.for_each(|key, value| {
            if result.is_ok() {
                result = writeln!(out, "({key}, {value})");
            }
        });
        result
    }

    /// Snapshot for `BACKUP`: the pairs visible at one instant, copied out
    /// under all-bucket read locks. Scheduling and file writing live in
    /// [`crate::backup`].
    pub fn backup_snapshot(&self) -> Vec<(String, String)> {
        self.store.snapshot()
    }

    /// `SUBSCRIBE` — registers `sink` for change notifications on `key`.
    /// Returns whether the key existed.
    pub fn subscribe(&self, key: &str, sink: &Arc<PipeHandle>) -> bool {
        self.store.subscribe(key, sink)
    }

    /// `UNSUBSCRIBE` — drops `sink_id`'s subscription on `key`. Returns
    /// whether the key existed.
    pub fn unsubscribe(&self, key: &str, sink_id: u64) -> bool {
        self.store.unsubscribe(key, sink_id)
    }

    /// `WAIT` — sleeps the calling worker. Never touches the store or the
    /// gate.
    pub fn wait(&self, delay_ms: u64) {
        thread::sleep(Duration::from_millis(delay_ms));
    }
}

/// Index of `key`'s bucket guard inside a lock plan.
fn slot(plan: &[usize], key: &str) -> usize {
    plan.binary_search(&Store::bucket_index(key))
        .expect("bucket missing from lock plan")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{MAX_KEY, NOTIFICATION_FRAME_SIZE, field_str};
    use std::fs::File;
    use std::thread;

    fn kvs() -> Kvs {
        Kvs::new(Arc::new(Store::new()))
    }

    fn pairs(input: &[(&str, &str)]) -> Vec<(String, String)> {
        input
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn keys(input: &[&str]) -> Vec<String> {
        input.iter().map(|k| k.to_string()).collect()
    }

    fn file_sink(dir: &tempfile::TempDir, name: &str) -> Arc<PipeHandle> {
        let path = dir.path().join(name);
        File::create(&path).unwrap();
        Arc::new(PipeHandle::open_write(&path).unwrap())
    }

    fn sink_frames(dir: &tempfile::TempDir, name: &str) -> Vec<(String, String)> {
        let bytes = std::fs::read(dir.path().join(name)).unwrap();
        bytes
            .chunks(NOTIFICATION_FRAME_SIZE)
            .map(|chunk| {
                let (key, value) = chunk.split_at(MAX_KEY + 1);
                (
                    field_str(key).unwrap().to_string(),
                    field_str(value).unwrap().to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn read_reports_missing_keys_inline() {
        let kvs = kvs();
        kvs.write(&pairs(&[("apple", "red"), ("banana", "yellow")]));
        let mut out = Vec::new();
        kvs.read(&keys(&["apple", "banana", "grape"]), &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "[(apple,red)(banana,yellow)(grape,KVSERROR)]\n"
        );
    }

    #[test]
    fn read_of_an_empty_batch_prints_brackets() {
        let kvs = kvs();
        let mut out = Vec::new();
        kvs.read(&[], &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "[]\n");
    }

    #[test]
    fn read_emits_sorted_order() {
        let kvs = kvs();
        kvs.write(&pairs(&[("b", "2"), ("a", "1")]));
        let mut out = Vec::new();
        kvs.read(&keys(&["b", "a"]), &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "[(a,1)(b,2)]\n");
    }

    #[test]
    fn delete_prints_only_missing_keys() {
        let kvs = kvs();
        kvs.write(&pairs(&[("apple", "red")]));
        let mut out = Vec::new();
        kvs.delete(&keys(&["apple"]), &mut out).unwrap();
        assert!(out.is_empty());

        let mut out = Vec::new();
        kvs.delete(&keys(&["apple", "grape"]), &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "[(apple,KVSMISSING)(grape,KVSMISSING)]\n"
        );
    }

    #[test]
    fn duplicate_keys_in_one_write_batch_last_value_wins() {
        let dir = tempfile::tempdir().unwrap();
        let kvs = kvs();
        let sink = file_sink(&dir, "sink");
        kvs.write(&pairs(&[("apple", "seed")]));
        kvs.subscribe("apple", &sink);

        kvs.write(&pairs(&[("apple", "red"), ("apple", "green")]));
        assert_eq!(kvs.store().get("apple").as_deref(), Some("green"));

        drop(sink);
        let frames = sink_frames(&dir, "sink");
        assert_eq!(frames, vec![("apple".to_string(), "green".to_string())]);
    }

    #[test]
    fn write_notifies_each_distinct_key_once() {
        let dir = tempfile::tempdir().unwrap();
        let kvs = kvs();
        let sink = file_sink(&dir, "sink");
        kvs.write(&pairs(&[("apple", "old"), ("banana", "old")]));
        kvs.subscribe("apple", &sink);
        kvs.subscribe("banana", &sink);

        kvs.write(&pairs(&[("banana", "yellow"), ("apple", "red")]));
        drop(sink);
        let mut frames = sink_frames(&dir, "sink");
        frames.sort();
        assert_eq!(
            frames,
            vec![
                ("apple".to_string(), "red".to_string()),
                ("banana".to_string(), "yellow".to_string()),
            ]
        );
    }

    #[test]
    fn delete_notifies_former_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let kvs = kvs();
        let sink = file_sink(&dir, "sink");
        kvs.write(&pairs(&[("apple", "red")]));
        kvs.subscribe("apple", &sink);

        let mut out = Vec::new();
        kvs.delete(&keys(&["apple"]), &mut out).unwrap();
        drop(sink);
        assert_eq!(
            sink_frames(&dir, "sink"),
            vec![("apple".to_string(), "DELETED".to_string())]
        );

        let mut out = Vec::new();
        kvs.read(&keys(&["apple"]), &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "[(apple,KVSERROR)]\n");
    }

    #[test]
    fn show_prints_one_line_per_pair() {
        let kvs = kvs();
        kvs.write(&pairs(&[("apple", "red"), ("banana", "yellow")]));
        let mut out = Vec::new();
        kvs.show(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "(apple, red)\n(banana, yellow)\n"
        );
    }

    #[test]
    fn show_sees_a_consistent_snapshot_under_concurrent_writes() {
        let kvs = Arc::new(kvs());
        kvs.write(&pairs(&[("apple", "red")]));

        let writer = {
            let kvs = Arc::clone(&kvs);
            thread::spawn(move || {
                for i in 0..500 {
                    let value = if i % 2 == 0 { "blue" } else { "red" };
                    kvs.write(&pairs(&[("apple", value)]));
                }
            })
        };

        for _ in 0..200 {
            let mut out = Vec::new();
            kvs.show(&mut out).unwrap();
            let text = String::from_utf8(out).unwrap();
            let apples: Vec<&str> = text
                .lines()
                .filter(|line| line.starts_with("(apple, "))
                .collect();
            assert_eq!(apples.len(), 1);
            assert!(apples[0] == "(apple, red)" || apples[0] == "(apple, blue)");
        }
        writer.join().unwrap();
    }

    #[test]
    fn overlapping_write_batches_do_not_deadlock() {
        let kvs = Arc::new(kvs());
        let forward = {
            let kvs = Arc::clone(&kvs);
            thread::spawn(move || {
                for _ in 0..500 {
                    kvs.write(&pairs(&[("alpha", "1"), ("zulu", "2")]));
                }
            })
        };
        let backward = {
            let kvs = Arc::clone(&kvs);
            thread::spawn(move || {
                for _ in 0..500 {
                    kvs.write(&pairs(&[("zulu", "3"), ("alpha", "4")]));
                }
            })
        };
        forward.join().unwrap();
        backward.join().unwrap();
        assert!(kvs.store().get("alpha").is_some());
        assert!(kvs.store().get("zulu").is_some());
    }

    #[test]
    fn interleaved_puts_and_gets_observe_written_values_only() {
        let kvs = Arc::new(kvs());
        let writer = {
            let kvs = Arc::clone(&kvs);
            thread::spawn(move || {
                for i in 0..300 {
                    kvs.write(&pairs(&[("counter", &i.to_string())]));
                }
            })
        };
        for _ in 0..300 {
            if let Some(value) = kvs.store().get("counter") {
                let parsed: u32 = value.parse().unwrap();
                assert!(parsed < 300);
            }
        }
        writer.join().unwrap();
    }
}
