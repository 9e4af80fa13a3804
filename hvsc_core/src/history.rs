//! Drift-threshold channel history log.
//!
//! One append-only file per channel (`Log_<key>.dat`). A row is
//! written only when the monitored voltage or current drifted beyond
//! its threshold since the last saved row; the reading immediately
//! before the drift is written too, so a step change keeps both of
//! its flanks in the file. Quiet channels cost nothing but the
//! comparison.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hvsc_common::cache::{ChannelReading, ReadingsCache};
use tracing::warn;

/// Drift thresholds deciding when a row is worth keeping.
#[derive(Debug, Clone, Copy)]
pub struct HistoryThresholds {
    /// Monitored-voltage drift [V].
    pub vmon: f64,
    /// Monitored-current drift [uA].
    pub imon: f64,
}

impl Default for HistoryThresholds {
    fn default() -> Self {
        Self {
            vmon: 0.5,
            imon: 0.05,
        }
    }
}

/// History file of one channel.
pub struct ChannelHistory {
    path: PathBuf,
    thresholds: HistoryThresholds,
    last_saved: Option<ChannelReading>,
    previous: Option<ChannelReading>,
}

impl ChannelHistory {
    pub fn new(dir: &Path, key: &str, thresholds: HistoryThresholds) -> Self {
        Self {
            path: dir.join(format!("Log_{key}.dat")),
            thresholds,
            last_saved: None,
            previous: None,
        }
    }

    /// Consider one reading; append row(s) if it drifted.
    pub fn record(&mut self, reading: ChannelReading) -> io::Result<()> {
        let drifted = match &self.last_saved {
            None => true,
            Some(last) => {
                (reading.vmon - last.vmon).abs() >= self.thresholds.vmon
                    || (reading.imon - last.imon).abs() >= self.thresholds.imon
            }
        };
        if drifted {
            let mut file = self.open()?;
            if let Some(prev) = self.previous {
                if self.last_saved != Some(prev) {
                    write_row(&mut file, &prev)?;
                }
            }
            write_row(&mut file, &reading)?;
            self.last_saved = Some(reading);
        }
        self.previous = Some(reading);
        Ok(())
    }

    fn open(&self) -> io::Result<File> {
        let fresh = !self.path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if fresh {
            writeln!(file, "# time [s]\tvset [V]\tvmon [V]\timon [uA]")?;
        }
        Ok(file)
    }
}

fn write_row(file: &mut File, reading: &ChannelReading) -> io::Result<()> {
    let secs = reading
        .at
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    writeln!(
        file,
        "{secs}\t{:.1}\t{:.1}\t{:.4}",
        reading.vset, reading.vmon, reading.imon
    )
}

/// Records every cached channel, creating per-channel files lazily.
pub struct HistoryLogger {
    dir: PathBuf,
    thresholds: HistoryThresholds,
    channels: BTreeMap<String, ChannelHistory>,
}

impl HistoryLogger {
    pub fn new(dir: &Path, thresholds: HistoryThresholds) -> Self {
        Self {
            dir: dir.to_path_buf(),
            thresholds,
            channels: BTreeMap::new(),
        }
    }

    /// One pass over the cache.
    pub fn record_all(&mut self, cache: &ReadingsCache) -> io::Result<()> {
        let mut keys = cache.channel_keys();
        keys.sort();
        for key in keys {
            let Some(reading) = cache.channel(&key) else {
                continue;
            };
            self.channels
                .entry(key.clone())
                .or_insert_with(|| ChannelHistory::new(&self.dir, &key, self.thresholds))
                .record(reading)?;
        }
        Ok(())
    }
}

/// Periodic history loop; write failures are logged, not fatal.
pub fn spawn_history_loop(
    logger: HistoryLogger,
    cache: Arc<ReadingsCache>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let logger = Mutex::new(logger);
    thread::Builder::new()
        .name("hvsc-history".into())
        .spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                let result = logger
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .record_all(&cache);
                if let Err(e) = result {
                    warn!(error = %e, "history write failed");
                }
                thread::sleep(interval);
            }
        })
        .unwrap_or_else(|e| panic!("failed to spawn history thread: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hvsc_common::flags::ChannelStatus;

    fn reading(vmon: f64, imon: f64) -> ChannelReading {
        ChannelReading {
            vset: vmon,
            iset: 0.0,
            vmon,
            imon,
            status: ChannelStatus::ON,
            at: SystemTime::now(),
        }
    }

    fn rows(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|l| !l.starts_with('#'))
            .map(String::from)
            .collect()
    }

    #[test]
    fn quiet_channel_writes_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut hist = ChannelHistory::new(dir.path(), "gemtop", HistoryThresholds::default());
        for _ in 0..10 {
            hist.record(reading(300.0, 0.3)).unwrap();
        }
        assert_eq!(rows(&dir.path().join("Log_gemtop.dat")).len(), 1);
    }

    #[test]
    fn drift_writes_both_flanks() {
        let dir = tempfile::tempdir().unwrap();
        let mut hist = ChannelHistory::new(dir.path(), "gemtop", HistoryThresholds::default());
        hist.record(reading(300.0, 0.3)).unwrap();
        hist.record(reading(300.1, 0.3)).unwrap(); // below threshold
        hist.record(reading(310.0, 0.31)).unwrap(); // drift

        let rows = rows(&dir.path().join("Log_gemtop.dat"));
        // Initial row, the pre-drift flank (300.1) and the drifted row.
        assert_eq!(rows.len(), 3);
        assert!(rows[1].contains("300.1"));
        assert!(rows[2].contains("310.0"));
    }

    #[test]
    fn current_drift_alone_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let mut hist = ChannelHistory::new(dir.path(), "gemtop", HistoryThresholds::default());
        hist.record(reading(300.0, 0.30)).unwrap();
        hist.record(reading(300.0, 0.40)).unwrap();
        assert_eq!(rows(&dir.path().join("Log_gemtop.dat")).len(), 2);
    }

    #[test]
    fn logger_covers_every_cached_channel() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ReadingsCache::new();
        cache.update_channel("gemtop", reading(300.0, 0.3));
        cache.update_channel("cathode", reading(7000.0, 1.2));

        let mut logger = HistoryLogger::new(dir.path(), HistoryThresholds::default());
        logger.record_all(&cache).unwrap();

        assert!(dir.path().join("Log_gemtop.dat").exists());
        assert!(dir.path().join("Log_cathode.dat").exists());
    }
}
