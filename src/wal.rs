use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Entries claiming a larger payload are treated as corruption.
const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Result of scanning a journal file.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte length of the intact prefix. Anything after it is a torn or corrupt tail.
    pub valid_len: u64,
    pub file_len: u64,
}

impl Replay {
    pub fn has_torn_tail(&self) -> bool {
        self.file_len > self.valid_len
    }
}

/// Append-only journal of store mutations.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`.
/// Recovery stops at the first short or corrupt entry and truncates the file there,
/// so later appends never land behind garbage.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the journal at `path` for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Replay `path`, cut off any torn tail, and open it for appending.
    pub fn recover(path: &Path) -> io::Result<(Vec<Event>, Self)> {
        let replay = Self::replay(path)?;
        if replay.has_torn_tail() {
            tracing::warn!(
                "journal {}: discarding {} trailing bytes",
                path.display(),
                replay.file_len - replay.valid_len
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        let mut wal = Self::open(path)?;
        wal.appends_since_compact = replay.events.len() as u64;
        Ok((replay.events, wal))
    }

    /// Append a single event and fsync. Tests only; production batches through
    /// `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without flushing. Call `flush_sync()` to commit the batch.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
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

    /// Write a compacted image to a temp file next to `path` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the temp file over the journal and reopen it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
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

    /// Scan the journal, returning every intact event and where the intact prefix ends.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut replay = Replay {
            file_len,
            ..Replay::default()
        };

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_RECORD_BYTES {
                break;
            }

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => replay.events.push(event),
                Err(_) => break,
            }
            replay.valid_len += (len + 8) as u64;
        }

        Ok(replay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CellRange, CellUpdate, Table};

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roomslot_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn appended(room: &str) -> Event {
        Event::RowsAppended {
            table: Table::Schedule,
            rows: vec![vec!["01/06/2025".into(), room.into(), "small".into()]],
        }
    }

    fn held(row: usize) -> Event {
        Event::CellsUpdated {
            table: Table::Schedule,
            updates: vec![CellUpdate::fill(CellRange::slots(row, 13, 16), "HOLD:1234567")],
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![appended("S-01"), held(2)];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, events);
        assert!(!replay.has_torn_tail());
    }

    #[test]
    fn recover_truncates_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&appended("S-01")).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }

        let (events, mut wal) = Wal::recover(&path).unwrap();
        assert_eq!(events, vec![appended("S-01")]);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);

        // New entries land right after the intact prefix and replay cleanly.
        wal.append(&held(2)).unwrap();
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![appended("S-01"), held(2)]);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert_eq!(replay.valid_len, 0);
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("corrupt_crc.wal");
        {
            let payload = bincode::serialize(&appended("S-01")).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert!(replay.has_torn_tail());
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let snapshot = vec![Event::TableReplaced {
            table: Table::Schedule,
            rows: vec![Table::Schedule.headers()],
        }];
        {
            let mut wal = Wal::open(&path).unwrap();
            for i in 0..10 {
                wal.append(&held(i + 2)).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(&snapshot).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);
            wal.append(&appended("M-01")).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events.len(), 2);
        assert_eq!(replay.events[0], snapshot[0]);
        assert_eq!(replay.events[1], appended("M-01"));
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let events: Vec<Event> = (2..7).map(held).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap().events, events);
    }
}
