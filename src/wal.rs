use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode one commit's events as a single `[len][bincode][crc32]` entry.
fn encode_entry(writer: &mut impl Write, events: &[Event]) -> io::Result<()> {
    let payload =
        bincode::serialize(events).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for WAL entry"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Fill `buf` completely. `Ok(false)` means the file ended first (clean end or torn write).
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read the next entry. `Ok(None)` stops replay: end of file, a truncated
/// tail, a CRC mismatch, or an undecodable payload.
fn decode_next(reader: &mut impl Read) -> io::Result<Option<Vec<Event>>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        tracing::warn!("WAL entry failed CRC check, discarding tail");
        return Ok(None);
    }
    Ok(bincode::deserialize::<Vec<Event>>(&payload).ok())
}

/// Append-only booking log.
///
/// Entry format: `[u32 LE: len][bincode: Vec<Event>][u32 LE: crc32 of payload]`.
/// An entry is one commit: its events replay together or not at all, and a
/// torn final entry left by a crash is dropped on replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync a single event. Production code goes through
    /// `append_buffered` + `flush_sync` so a batch shares one fsync.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(std::slice::from_ref(event))?;
        self.flush_sync()
    }

    /// Buffer one commit. Counts as a single append however many events it holds.
    pub fn append_buffered(&mut self, events: &[Event]) -> io::Result<()> {
        encode_entry(&mut self.writer, events)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted event set to a temp file next to the WAL and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            encode_entry(&mut writer, std::slice::from_ref(event))?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the WAL and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay every valid event from disk. A missing file replays as empty.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(entry) = decode_next(&mut reader)? {
            events.extend(entry);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TimeOfDay, TimeSlot};
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("concierge_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn requested(amenity: &str) -> Event {
        Event::BookingRequested {
            id: Ulid::new(),
            resident_id: "r1".into(),
            resident_name: "Ruth One".into(),
            resident_email: "ruth@example.com".into(),
            amenity_id: amenity.into(),
            date: NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(),
            slot: TimeSlot::new(
                TimeOfDay::from_hm(14, 0).unwrap(),
                TimeOfDay::from_hm(15, 0).unwrap(),
            ),
            created_at: 0,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let first = requested("pool");
        let events = vec![
            first.clone(),
            Event::BookingConfirmed {
                id: first.booking_id(),
                amenity_id: "pool".into(),
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = requested("gym");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap(); // length says 9, only 2 bytes follow
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let good = requested("pool");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&vec![requested("pool")]).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_replaces_history() {
        let path = tmp_path("compact.wal");
        let kept = requested("pool");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();
            for _ in 0..10 {
                let churn = requested("pool");
                wal.append(&churn).unwrap();
                wal.append(&Event::BookingDeleted {
                    id: churn.booking_id(),
                    amenity_id: "pool".into(),
                })
                .unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(std::slice::from_ref(&kept)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_after_compact() {
        let path = tmp_path("compact_append.wal");
        let kept = requested("bbq");
        let later = Event::BookingCancelled {
            id: kept.booking_id(),
            amenity_id: "bbq".into(),
        };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();
            wal.compact(std::slice::from_ref(&kept)).unwrap();
            wal.append(&later).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_count_until_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|_| requested("pool")).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(std::slice::from_ref(e)).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn multi_event_entry_replays_whole() {
        let path = tmp_path("multi_event.wal");
        let booked = requested("pool");
        let commit = vec![
            Event::BookingConfirmed {
                id: booked.booking_id(),
                amenity_id: "pool".into(),
            },
            Event::BookingRescheduled {
                id: booked.booking_id(),
                amenity_id: "pool".into(),
                slot: TimeSlot::new(
                    TimeOfDay::from_hm(16, 0).unwrap(),
                    TimeOfDay::from_hm(17, 0).unwrap(),
                ),
            },
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&booked).unwrap();
            wal.append_buffered(&commit).unwrap();
            wal.flush_sync().unwrap();
            assert_eq!(wal.appends_since_compact(), 2);
        }

        let mut expected = vec![booked];
        expected.extend(commit);
        assert_eq!(Wal::replay(&path).unwrap(), expected);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn torn_multi_event_entry_drops_every_event() {
        let path = tmp_path("torn_multi_event.wal");
        let booked = requested("gym");
        let commit = vec![
            Event::BookingConfirmed {
                id: booked.booking_id(),
                amenity_id: "gym".into(),
            },
            Event::BookingCancelled {
                id: booked.booking_id(),
                amenity_id: "gym".into(),
            },
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&booked).unwrap();
            wal.append_buffered(&commit).unwrap();
            wal.flush_sync().unwrap();
        }
        // Cut the last entry short, leaving its first event's bytes on disk.
        let len = fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(len - 6).unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), vec![booked]);
        let _ = fs::remove_file(&path);
    }
}
