use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};

use crate::model::{CellRange, CellUpdate, Event, Table};
use crate::observability;
use crate::wal::Wal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached or refused the call. Worth retrying for reads.
    Unavailable(String),
    /// A range addressed a row that does not exist.
    OutOfBounds(CellRange),
    Journal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
            StoreError::OutOfBounds(range) => write!(f, "range {range} out of bounds"),
            StoreError::Journal(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Row/column contract of the backing store. Rows and columns are 1-based and row 1 is the
/// header; every method is one round trip.
#[async_trait]
pub trait TabularStore: Send + Sync {
    /// Every row of `table`, header included.
    async fn read_all(&self, table: Table) -> Result<Vec<Vec<String>>, StoreError>;

    /// Append `rows` and return the 1-based row number of the first one.
    async fn append_rows(&self, table: Table, rows: Vec<Vec<String>>) -> Result<usize, StoreError>;

    /// One value vector per range, padded with `""` to the range width.
    async fn batch_get(
        &self,
        table: Table,
        ranges: &[CellRange],
    ) -> Result<Vec<Vec<String>>, StoreError>;

    async fn batch_update(&self, table: Table, updates: Vec<CellUpdate>) -> Result<(), StoreError>;

    /// Write the header row if the table has none.
    async fn ensure_header(&self, table: Table) -> Result<(), StoreError> {
        let rows = self.read_all(table).await?;
        match rows.first() {
            None => {
                self.append_rows(table, vec![table.headers()]).await?;
            }
            Some(first) if first.iter().all(|c| c.trim().is_empty()) => {
                let headers = table.headers();
                let range = CellRange::new(1, 1, headers.len());
                self.batch_update(table, vec![CellUpdate { range, values: headers }])
                    .await?;
            }
            Some(_) => {}
        }
        Ok(())
    }
}

// ── Group-commit journal channel ─────────────────────────────

pub(crate) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the journal and batches appends so one fsync covers every append queued behind it.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => batch.push((event, response)),
                        other => {
                            deferred = Some(other);
                            break;
                        }
                    }
                }

                metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

/// Apply a journaled mutation to one table image.
fn apply_event(rows: &mut Vec<Vec<String>>, event: &Event) {
    match event {
        Event::RowsAppended { rows: new_rows, .. } => rows.extend(new_rows.iter().cloned()),
        Event::CellsUpdated { updates, .. } => {
            for update in updates {
                let Some(row) = rows.get_mut(update.range.row - 1) else {
                    continue;
                };
                if row.len() < update.range.last_col {
                    row.resize(update.range.last_col, String::new());
                }
                for (offset, value) in update.values.iter().enumerate().take(update.range.width()) {
                    row[update.range.first_col - 1 + offset] = value.clone();
                }
            }
        }
        Event::TableReplaced { rows: image, .. } => *rows = image.clone(),
    }
}

fn event_table(event: &Event) -> Table {
    match event {
        Event::RowsAppended { table, .. }
        | Event::CellsUpdated { table, .. }
        | Event::TableReplaced { table, .. } => *table,
    }
}

fn check_bounds(rows: &[Vec<String>], range: &CellRange) -> Result<(), StoreError> {
    if range.row == 0 || range.row > rows.len() || range.first_col == 0 {
        return Err(StoreError::OutOfBounds(*range));
    }
    Ok(())
}

type SharedTable = Arc<RwLock<Vec<Vec<String>>>>;

/// In-process tabular store. Each table is a row vector behind its own lock; mutations are
/// journaled before they are applied when a journal is attached.
pub struct LocalStore {
    tables: DashMap<Table, SharedTable>,
    journal: Option<mpsc::Sender<WalCommand>>,
    calls: AtomicU64,
}

impl LocalStore {
    /// Store without a journal. State lives as long as the value.
    pub fn ephemeral() -> Self {
        Self::from_images(HashMap::new(), None)
    }

    /// Replay the journal at `path` and keep appending to it. Must run inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (events, wal) = Wal::recover(path)?;
        let mut images: HashMap<Table, Vec<Vec<String>>> = HashMap::new();
        for event in &events {
            apply_event(images.entry(event_table(event)).or_default(), event);
        }
        tracing::info!("journal {}: replayed {} events", path.display(), events.len());

        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, rx));
        Ok(Self::from_images(images, Some(tx)))
    }

    fn from_images(mut images: HashMap<Table, Vec<Vec<String>>>, journal: Option<mpsc::Sender<WalCommand>>) -> Self {
        let tables = DashMap::new();
        for table in Table::ALL {
            let rows = images.remove(&table).unwrap_or_default();
            tables.insert(table, Arc::new(RwLock::new(rows)));
        }
        Self {
            tables,
            journal,
            calls: AtomicU64::new(0),
        }
    }

    /// Number of trait calls served so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn table(&self, table: Table) -> SharedTable {
        self.tables
            .entry(table)
            .or_insert_with(|| Arc::new(RwLock::new(Vec::new())))
            .value()
            .clone()
    }

    fn count(&self, op: &'static str) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(observability::STORE_CALLS_TOTAL, "op" => op).increment(1);
    }

    async fn journal_append(&self, event: &Event) -> Result<(), StoreError> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        journal
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Journal("journal writer dropped response".into()))?
            .map_err(|e| StoreError::Journal(e.to_string()))
    }

    /// Journal `event` and apply it to the locked table image.
    async fn persist_and_apply(&self, rows: &mut Vec<Vec<String>>, event: &Event) -> Result<(), StoreError> {
        self.journal_append(event).await?;
        apply_event(rows, event);
        Ok(())
    }

    /// Rewrite the journal as one snapshot event per table. Writers wait until the swap is done.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let shared: Vec<(Table, SharedTable)> = Table::ALL.iter().map(|&t| (t, self.table(t))).collect();
        let mut guards = Vec::with_capacity(shared.len());
        for (table, rows) in &shared {
            guards.push((*table, rows.read().await));
        }
        let events = guards
            .iter()
            .map(|(table, rows)| Event::TableReplaced {
                table: *table,
                rows: rows.to_vec(),
            })
            .collect();

        let (tx, rx) = oneshot::channel();
        journal
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Journal("journal writer dropped response".into()))?
            .map_err(|e| StoreError::Journal(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let Some(journal) = &self.journal else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if journal
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl TabularStore for LocalStore {
    async fn read_all(&self, table: Table) -> Result<Vec<Vec<String>>, StoreError> {
        self.count("read_all");
        let rows = self.table(table);
        let guard = rows.read().await;
        Ok(guard.clone())
    }

    async fn append_rows(&self, table: Table, rows: Vec<Vec<String>>) -> Result<usize, StoreError> {
        self.count("append_rows");
        let shared = self.table(table);
        let mut guard = shared.write().await;
        let first_row = guard.len() + 1;
        if rows.is_empty() {
            return Ok(first_row);
        }
        self.persist_and_apply(&mut guard, &Event::RowsAppended { table, rows })
            .await?;
        Ok(first_row)
    }

    async fn batch_get(
        &self,
        table: Table,
        ranges: &[CellRange],
    ) -> Result<Vec<Vec<String>>, StoreError> {
        self.count("batch_get");
        let shared = self.table(table);
        let guard = shared.read().await;
        let mut out = Vec::with_capacity(ranges.len());
        for range in ranges {
            check_bounds(&guard, range)?;
            let row = &guard[range.row - 1];
            out.push(
                (range.first_col..=range.last_col)
                    .map(|col| row.get(col - 1).cloned().unwrap_or_default())
                    .collect(),
            );
        }
        Ok(out)
    }

    async fn batch_update(&self, table: Table, updates: Vec<CellUpdate>) -> Result<(), StoreError> {
        self.count("batch_update");
        let shared = self.table(table);
        let mut guard = shared.write().await;
        for update in &updates {
            check_bounds(&guard, &update.range)?;
        }
        if updates.is_empty() {
            return Ok(());
        }
        self.persist_and_apply(&mut guard, &Event::CellsUpdated { table, updates })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roomslot_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn append_reports_first_row() {
        let store = LocalStore::ephemeral();
        store.ensure_header(Table::Schedule).await.unwrap();
        let first = store
            .append_rows(Table::Schedule, vec![row(&["01/06/2025", "S-01", "small"]), row(&["01/06/2025", "S-02", "small"])])
            .await
            .unwrap();
        assert_eq!(first, 2);
        let next = store
            .append_rows(Table::Schedule, vec![row(&["01/06/2025", "S-03", "small"])])
            .await
            .unwrap();
        assert_eq!(next, 4);
    }

    #[tokio::test]
    async fn ensure_header_is_idempotent() {
        let store = LocalStore::ephemeral();
        store.ensure_header(Table::Bookings).await.unwrap();
        store.ensure_header(Table::Bookings).await.unwrap();
        let rows = store.read_all(Table::Bookings).await.unwrap();
        assert_eq!(rows, vec![Table::Bookings.headers()]);
    }

    #[tokio::test]
    async fn batch_get_pads_short_rows() {
        let store = LocalStore::ephemeral();
        store.ensure_header(Table::Schedule).await.unwrap();
        store
            .append_rows(Table::Schedule, vec![row(&["01/06/2025", "M-01", "medium"])])
            .await
            .unwrap();
        let got = store
            .batch_get(Table::Schedule, &[CellRange::slots(2, 13, 16)])
            .await
            .unwrap();
        assert_eq!(got, vec![vec![String::new(); 4]]);
    }

    #[tokio::test]
    async fn batch_update_extends_and_writes() {
        let store = LocalStore::ephemeral();
        store.ensure_header(Table::Schedule).await.unwrap();
        store
            .append_rows(Table::Schedule, vec![row(&["01/06/2025", "M-01", "medium"])])
            .await
            .unwrap();
        store
            .batch_update(
                Table::Schedule,
                vec![
                    CellUpdate::fill(CellRange::slots(2, 13, 14), "HOLD:1234567"),
                    CellUpdate::fill(CellRange::slots(2, 16, 16), "HOLD:1234567"),
                ],
            )
            .await
            .unwrap();
        let got = store
            .batch_get(Table::Schedule, &[CellRange::slots(2, 13, 16)])
            .await
            .unwrap();
        assert_eq!(got[0], row(&["HOLD:1234567", "HOLD:1234567", "", "HOLD:1234567"]));
    }

    #[tokio::test]
    async fn out_of_bounds_update_changes_nothing() {
        let store = LocalStore::ephemeral();
        store.ensure_header(Table::Schedule).await.unwrap();
        store
            .append_rows(Table::Schedule, vec![row(&["01/06/2025", "M-01", "medium"])])
            .await
            .unwrap();
        let before = store.read_all(Table::Schedule).await.unwrap();
        let err = store
            .batch_update(
                Table::Schedule,
                vec![
                    CellUpdate::fill(CellRange::slots(2, 1, 1), "x"),
                    CellUpdate::fill(CellRange::slots(9, 1, 1), "x"),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::OutOfBounds(r) if r.row == 9));
        assert!(!err.is_transient());
        assert_eq!(store.read_all(Table::Schedule).await.unwrap(), before);
    }

    #[tokio::test]
    async fn calls_are_counted() {
        let store = LocalStore::ephemeral();
        assert_eq!(store.calls(), 0);
        store.read_all(Table::Rooms).await.unwrap();
        store.batch_get(Table::Rooms, &[]).await.unwrap();
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test]
    async fn journal_replay_restores_tables() {
        let path = test_wal_path("replay_tables.wal");
        {
            let store = LocalStore::open(&path).unwrap();
            store.ensure_header(Table::Schedule).await.unwrap();
            store
                .append_rows(Table::Schedule, vec![row(&["01/06/2025", "L-01", "large"])])
                .await
                .unwrap();
            store
                .batch_update(Table::Schedule, vec![CellUpdate::fill(CellRange::slots(2, 3, 4), "BKG-0123456789")])
                .await
                .unwrap();
        }

        let store = LocalStore::open(&path).unwrap();
        let got = store
            .batch_get(Table::Schedule, &[CellRange::slots(2, 2, 5)])
            .await
            .unwrap();
        assert_eq!(got[0], row(&["", "BKG-0123456789", "BKG-0123456789", ""]));
    }

    #[tokio::test]
    async fn compact_survives_restart() {
        let path = test_wal_path("compact_restart.wal");
        {
            let store = LocalStore::open(&path).unwrap();
            store.ensure_header(Table::Rooms).await.unwrap();
            for i in 0..20 {
                store
                    .append_rows(Table::Rooms, vec![row(&[&format!("S-{i:02}"), "small", "2", "3"])])
                    .await
                    .unwrap();
            }
            assert!(store.appends_since_compact().await >= 21);
            let before = std::fs::metadata(&path).unwrap().len();
            store.compact().await.unwrap();
            assert_eq!(store.appends_since_compact().await, 0);
            assert!(std::fs::metadata(&path).unwrap().len() < before);

            store
                .append_rows(Table::Rooms, vec![row(&["L-01", "large", "7", "9"])])
                .await
                .unwrap();
        }

        let store = LocalStore::open(&path).unwrap();
        let rows = store.read_all(Table::Rooms).await.unwrap();
        assert_eq!(rows.len(), 22);
        assert_eq!(rows[21][0], "L-01");
    }

    #[tokio::test]
    async fn ephemeral_compact_is_noop() {
        let store = LocalStore::ephemeral();
        store.compact().await.unwrap();
        assert_eq!(store.appends_since_compact().await, 0);
    }
}
