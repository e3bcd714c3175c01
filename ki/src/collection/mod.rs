//! Adapter over the binary note database. The sync driver only ever goes
//! through this contract; it never touches rows itself.

use crate::helpers::{md5_hex, strip_html_tags};
use crate::model::{ColNote, Deck, DeckId, NoteId, Notetype, NotetypeId};
use crate::paths::ExtantFile;
use crate::{Error, LibraryError, NoteErrorKind, NotetypeErrorKind};
use indexmap::IndexMap;
use log::debug;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{ConnectOptions, Connection, SqliteConnection, SqlitePool};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

mod schema;

pub use schema::{DEFAULT_DECK_ID, DEFAULT_DECK_NAME};

/// Separator between field values in the `notes.flds` column.
const FIELD_SEPARATOR: char = '\u{1f}';

fn sqlx_err(source: sqlx::Error) -> Error {
    Error::Sqlx { source }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// First-field checksum used for duplicate detection.
fn field_checksum(text: &str) -> i64 {
    let digest = md5_hex(&strip_html_tags(text));
    i64::from(u32::from_str_radix(&digest[..8], 16).unwrap_or(0))
}

/// Outcome of the per-note fields health check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldsCheck {
    Normal,
    Empty,
    Duplicate,
}

impl FieldsCheck {
    /// Numeric health code, matching the desktop client's convention.
    pub fn code(self) -> u8 {
        match self {
            FieldsCheck::Normal => 0,
            FieldsCheck::Empty => 1,
            FieldsCheck::Duplicate => 2,
        }
    }
}

/// An opened collection. Notetypes and decks live in the `col` row as JSON
/// and are held in memory until [`Collection::close`] flushes them back.
pub struct Collection {
    pool: SqlitePool,
    path: PathBuf,
    models: IndexMap<NotetypeId, Notetype>,
    decks: IndexMap<DeckId, Deck>,
    dirty: bool,
}

impl Collection {
    /// Create a fresh, empty collection database at `path`.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(sqlx_err)?;
        sqlx::raw_sql(schema::SCHEMA)
            .execute(&pool)
            .await
            .map_err(sqlx_err)?;

        let default_deck = Deck {
            id: schema::DEFAULT_DECK_ID,
            name: schema::DEFAULT_DECK_NAME.to_string(),
            extra: serde_json::Map::new(),
        };
        let mut decks = IndexMap::new();
        decks.insert(default_deck.id, default_deck);

        let now = now_secs();
        sqlx::query(
            r"INSERT INTO col (id, crt, mod, scm, ver, dty, usn, ls, conf, models, decks, dconf, tags)
              VALUES (1, ?, ?, ?, ?, 0, 0, 0, '{}', '{}', ?, '{}', '{}')",
        )
        .bind(now)
        .bind(now)
        .bind(now_millis())
        .bind(schema::SCHEMA_VERSION)
        .bind(serde_json::to_string(&keyed(&decks)).map_err(|e| Error::Json {
            description: "Failed to serialize decks".to_string(),
            source: e,
        })?)
        .execute(&pool)
        .await
        .map_err(sqlx_err)?;

        Ok(Self {
            pool,
            path,
            models: IndexMap::new(),
            decks,
            dirty: false,
        })
    }

    pub async fn open(col_file: &ExtantFile) -> Result<Self, Error> {
        let path = col_file.as_path().to_path_buf();
        let options = SqliteConnectOptions::new().filename(&path);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(sqlx_err)?;
        let (models_json, decks_json): (String, String) =
            sqlx::query_as(r"SELECT models, decks FROM col")
                .fetch_one(&pool)
                .await
                .map_err(sqlx_err)?;
        let models = unkeyed::<Notetype>(&models_json)?
            .into_iter()
            .map(|nt| (nt.id, nt))
            .collect();
        let decks = unkeyed::<Deck>(&decks_json)?
            .into_iter()
            .map(|d| (d.id, d))
            .collect();
        Ok(Self {
            pool,
            path,
            models,
            decks,
            dirty: false,
        })
    }

    /// Flush in-memory notetype/deck state and close the connection.
    pub async fn close(self) -> Result<(), Error> {
        if self.dirty {
            sqlx::query(r"UPDATE col SET models = ?, decks = ?, mod = ?")
                .bind(serde_json::to_string(&keyed(&self.models)).map_err(|e| Error::Json {
                    description: "Failed to serialize models".to_string(),
                    source: e,
                })?)
                .bind(serde_json::to_string(&keyed(&self.decks)).map_err(|e| Error::Json {
                    description: "Failed to serialize decks".to_string(),
                    source: e,
                })?)
                .bind(now_secs())
                .execute(&self.pool)
                .await
                .map_err(sqlx_err)?;
        }
        self.pool.close().await;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All note ids, in insertion order.
    pub async fn find_notes(&self) -> Result<Vec<NoteId>, Error> {
        let rows: Vec<(NoteId,)> = sqlx::query_as(r"SELECT id FROM notes ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn get_note(&self, nid: NoteId) -> Result<ColNote, Error> {
        let row: Option<(String, NotetypeId, String, String)> =
            sqlx::query_as(r"SELECT guid, mid, tags, flds FROM notes WHERE id = ?")
                .bind(nid)
                .fetch_optional(&self.pool)
                .await
                .map_err(sqlx_err)?;
        let Some((guid, mid, tags, flds)) = row else {
            return Err(Error::Library(LibraryError::Note(
                NoteErrorKind::MissingNoteId(nid),
            )));
        };
        let notetype = self.notetype(mid)?;
        let values: Vec<&str> = flds.split(FIELD_SEPARATOR).collect();
        let fields = notetype
            .flds
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), values.get(i).copied().unwrap_or("").to_string()))
            .collect();

        let did: Option<(DeckId,)> =
            sqlx::query_as(r"SELECT did FROM cards WHERE nid = ? ORDER BY ord LIMIT 1")
                .bind(nid)
                .fetch_optional(&self.pool)
                .await
                .map_err(sqlx_err)?;
        let deck = did
            .and_then(|(did,)| self.deck_name(did))
            .unwrap_or(schema::DEFAULT_DECK_NAME)
            .to_string();

        Ok(ColNote {
            nid,
            guid,
            notetype_id: mid,
            deck,
            tags: tags.split_whitespace().map(str::to_string).collect(),
            fields,
        })
    }

    /// Add a new note of the given notetype, assigning a fresh nid. Field
    /// values must already be in notetype field order and HTML form.
    pub async fn add_note(
        &mut self,
        notetype_id: NotetypeId,
        fields: &[String],
        tags: &[String],
        deck: &str,
    ) -> Result<NoteId, Error> {
        let (sortf, template_count) = {
            let notetype = self.notetype(notetype_id)?;
            (notetype.sortf as usize, notetype.tmpls.len())
        };
        let did = self.deck_id(deck);

        let mut nid = now_millis();
        while self.note_exists(nid).await? {
            nid += 1;
        }
        let flds = fields.join(&FIELD_SEPARATOR.to_string());
        let sfld = strip_html_tags(fields.get(sortf).map_or("", |s| s.as_str()));
        let csum = field_checksum(fields.first().map_or("", |s| s.as_str()));
        let guid = md5_hex(&format!("{}{}", nid, flds))[..10].to_string();
        sqlx::query(
            r"INSERT INTO notes (id, guid, mid, mod, usn, tags, flds, sfld, csum, flags, data)
              VALUES (?, ?, ?, ?, -1, ?, ?, ?, ?, 0, '')",
        )
        .bind(nid)
        .bind(&guid)
        .bind(notetype_id)
        .bind(now_secs())
        .bind(join_tags(tags))
        .bind(&flds)
        .bind(&sfld)
        .bind(csum)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;

        for ord in 0..template_count.max(1) {
            sqlx::query(
                r"INSERT INTO cards (id, nid, did, ord, mod, usn, type, queue, due, ivl,
                                     factor, reps, lapses, left, odue, odid, flags, data)
                  VALUES (?, ?, ?, ?, ?, -1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, '')",
            )
            .bind(now_millis() + ord as i64)
            .bind(nid)
            .bind(did)
            .bind(ord as i64)
            .bind(now_secs())
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        }
        self.dirty = true;
        debug!("added note {} to deck '{}'", nid, deck);
        Ok(nid)
    }

    /// Overwrite an existing note's fields, tags, and deck.
    pub async fn update_note(
        &mut self,
        nid: NoteId,
        fields: &[String],
        tags: &[String],
        deck: &str,
    ) -> Result<(), Error> {
        let row: Option<(NotetypeId,)> = sqlx::query_as(r"SELECT mid FROM notes WHERE id = ?")
            .bind(nid)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        let Some((mid,)) = row else {
            return Err(Error::Library(LibraryError::Note(
                NoteErrorKind::MissingNoteId(nid),
            )));
        };
        let sortf = self.notetype(mid)?.sortf as usize;
        let did = self.deck_id(deck);

        let flds = fields.join(&FIELD_SEPARATOR.to_string());
        let sfld = strip_html_tags(fields.get(sortf).map_or("", |s| s.as_str()));
        let csum = field_checksum(fields.first().map_or("", |s| s.as_str()));
        sqlx::query(r"UPDATE notes SET tags = ?, flds = ?, sfld = ?, csum = ?, mod = ?, usn = -1 WHERE id = ?")
            .bind(join_tags(tags))
            .bind(&flds)
            .bind(&sfld)
            .bind(csum)
            .bind(now_secs())
            .bind(nid)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        sqlx::query(r"UPDATE cards SET did = ?, mod = ?, usn = -1 WHERE nid = ?")
            .bind(did)
            .bind(now_secs())
            .bind(nid)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        self.dirty = true;
        Ok(())
    }

    pub async fn remove_notes(&mut self, nids: &[NoteId]) -> Result<(), Error> {
        for nid in nids {
            sqlx::query(r"DELETE FROM cards WHERE nid = ?")
                .bind(nid)
                .execute(&self.pool)
                .await
                .map_err(sqlx_err)?;
            sqlx::query(r"DELETE FROM notes WHERE id = ?")
                .bind(nid)
                .execute(&self.pool)
                .await
                .map_err(sqlx_err)?;
            sqlx::query(r"INSERT INTO graves (usn, oid, type) VALUES (-1, ?, 1)")
                .bind(nid)
                .execute(&self.pool)
                .await
                .map_err(sqlx_err)?;
        }
        self.dirty = !nids.is_empty() || self.dirty;
        Ok(())
    }

    async fn note_exists(&self, nid: NoteId) -> Result<bool, Error> {
        let row: Option<(i64,)> = sqlx::query_as(r"SELECT 1 FROM notes WHERE id = ?")
            .bind(nid)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(row.is_some())
    }

    /// Health check: empty first field, or duplicate of another note of the
    /// same notetype.
    pub async fn fields_check(&self, nid: NoteId) -> Result<FieldsCheck, Error> {
        let row: Option<(NotetypeId, String, i64)> =
            sqlx::query_as(r"SELECT mid, flds, csum FROM notes WHERE id = ?")
                .bind(nid)
                .fetch_optional(&self.pool)
                .await
                .map_err(sqlx_err)?;
        let Some((mid, flds, csum)) = row else {
            return Err(Error::Library(LibraryError::Note(
                NoteErrorKind::MissingNoteId(nid),
            )));
        };
        let first = flds.split(FIELD_SEPARATOR).next().unwrap_or("");
        if strip_html_tags(first).trim().is_empty() {
            return Ok(FieldsCheck::Empty);
        }
        let dup: Option<(i64,)> = sqlx::query_as(
            r"SELECT 1 FROM notes WHERE csum = ? AND mid = ? AND id != ? LIMIT 1",
        )
        .bind(csum)
        .bind(mid)
        .bind(nid)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_err)?;
        if dup.is_some() {
            return Ok(FieldsCheck::Duplicate);
        }
        Ok(FieldsCheck::Normal)
    }

    pub fn notetype(&self, id: NotetypeId) -> Result<&Notetype, Error> {
        self.models.get(&id).ok_or_else(|| {
            Error::Library(LibraryError::Notetype(NotetypeErrorKind::MissingId(id)))
        })
    }

    pub fn notetype_by_name(&self, name: &str) -> Option<&Notetype> {
        self.models.values().find(|nt| nt.name == name)
    }

    pub fn id_for_name(&self, name: &str) -> Option<NotetypeId> {
        self.notetype_by_name(name).map(|nt| nt.id)
    }

    pub fn notetypes(&self) -> impl Iterator<Item = &Notetype> {
        self.models.values()
    }

    /// Append a checksum suffix to the notetype's name until it collides
    /// with nothing in the collection.
    pub fn ensure_name_unique(&self, notetype: &mut Notetype) {
        while self.notetype_by_name(&notetype.name).is_some() {
            let suffix = &md5_hex(&format!("{}{}", notetype.name, notetype.id))[..8];
            notetype.name = format!("{}-{}", notetype.name, suffix);
        }
    }

    /// Register a notetype. A zero or colliding id is replaced with a fresh
    /// one; the (possibly rewritten) id is returned.
    pub fn add_notetype(&mut self, mut notetype: Notetype) -> NotetypeId {
        if notetype.id == 0 || self.models.contains_key(&notetype.id) {
            let mut id = now_millis();
            while self.models.contains_key(&id) {
                id += 1;
            }
            notetype.id = id;
        }
        let id = notetype.id;
        self.models.insert(id, notetype);
        self.dirty = true;
        id
    }

    /// Id of the named deck, creating it (and any missing ancestors) first
    /// if necessary.
    pub fn deck_id(&mut self, name: &str) -> DeckId {
        let mut prefix = String::new();
        let mut did = schema::DEFAULT_DECK_ID;
        for component in name.split("::") {
            if prefix.is_empty() {
                prefix = component.to_string();
            } else {
                prefix = format!("{}::{}", prefix, component);
            }
            did = match self.decks.values().find(|d| d.name == prefix) {
                Some(deck) => deck.id,
                None => {
                    let mut id = now_millis();
                    while self.decks.contains_key(&id) {
                        id += 1;
                    }
                    self.decks.insert(
                        id,
                        Deck {
                            id,
                            name: prefix.clone(),
                            extra: serde_json::Map::new(),
                        },
                    );
                    self.dirty = true;
                    id
                }
            };
        }
        did
    }

    pub fn deck_name(&self, did: DeckId) -> Option<&str> {
        self.decks.get(&did).map(|d| d.name.as_str())
    }
}

fn join_tags(tags: &[String]) -> String {
    if tags.is_empty() {
        String::new()
    } else {
        format!(" {} ", tags.join(" "))
    }
}

/// Re-key a map by stringified id, the layout used in the `col` JSON columns.
fn keyed<T: serde::Serialize>(map: &IndexMap<i64, T>) -> IndexMap<String, &T> {
    map.iter().map(|(id, v)| (id.to_string(), v)).collect()
}

fn unkeyed<T: serde::de::DeserializeOwned>(json: &str) -> Result<Vec<T>, Error> {
    let map: IndexMap<String, T> = serde_json::from_str(json).map_err(|e| Error::Json {
        description: "Failed to parse col JSON".to_string(),
        source: e,
    })?;
    Ok(map.into_values().collect())
}

/// An exclusive transactional lock on the collection database, held for the
/// whole of a push or pull. Advisory with respect to the desktop client: if
/// the client holds the write lock, acquisition fails immediately.
pub struct CollectionLock {
    conn: SqliteConnection,
}

impl CollectionLock {
    pub async fn acquire(col_file: &ExtantFile) -> Result<Self, Error> {
        let options = SqliteConnectOptions::new()
            .filename(col_file.as_path())
            .busy_timeout(std::time::Duration::ZERO);
        let mut conn = options.connect().await.map_err(sqlx_err)?;
        sqlx::query("BEGIN EXCLUSIVE")
            .execute(&mut conn)
            .await
            .map_err(sqlx_err)?;
        Ok(Self { conn })
    }

    pub async fn release(mut self) -> Result<(), Error> {
        sqlx::query("COMMIT")
            .execute(&mut self.conn)
            .await
            .map_err(sqlx_err)?;
        self.conn.close().await.map_err(sqlx_err)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{Field, Template};
    use pretty_assertions::assert_eq;

    pub(crate) fn basic_notetype() -> Notetype {
        Notetype {
            id: 1_651_363_200_000,
            name: "Basic".to_string(),
            kind: 0,
            flds: vec![
                Field {
                    name: "Front".to_string(),
                    ord: Some(0),
                    extra: serde_json::Map::new(),
                },
                Field {
                    name: "Back".to_string(),
                    ord: Some(1),
                    extra: serde_json::Map::new(),
                },
            ],
            tmpls: vec![Template {
                name: "Card 1".to_string(),
                qfmt: "{{Front}}".to_string(),
                afmt: "{{FrontSide}}<hr id=answer>{{Back}}".to_string(),
                ord: Some(0),
                extra: serde_json::Map::new(),
            }],
            sortf: 0,
            extra: serde_json::Map::new(),
        }
    }

    async fn scratch() -> (tempfile::TempDir, Collection) {
        let tmp = tempfile::tempdir().unwrap();
        let mut col = Collection::create(tmp.path().join("collection.anki2"))
            .await
            .unwrap();
        col.add_notetype(basic_notetype());
        (tmp, col)
    }

    #[tokio::test]
    async fn test_add_and_get_note() {
        let (_tmp, mut col) = scratch().await;
        let mid = col.id_for_name("Basic").unwrap();
        let nid = col
            .add_note(
                mid,
                &["r".to_string(), "s".to_string()],
                &["math".to_string()],
                "a",
            )
            .await
            .unwrap();
        let note = col.get_note(nid).await.unwrap();
        assert_eq!(note.deck, "a");
        assert_eq!(note.tags, vec!["math"]);
        assert_eq!(note.fields["Front"], "r");
        assert_eq!(note.fields["Back"], "s");
        assert_eq!(col.find_notes().await.unwrap(), vec![nid]);
    }

    #[tokio::test]
    async fn test_get_note_missing_is_typed() {
        let (_tmp, col) = scratch().await;
        let err = col.get_note(42).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Library(LibraryError::Note(NoteErrorKind::MissingNoteId(42)))
        ));
    }

    #[tokio::test]
    async fn test_update_note_moves_deck_and_fields() {
        let (_tmp, mut col) = scratch().await;
        let mid = col.id_for_name("Basic").unwrap();
        let nid = col
            .add_note(mid, &["r".to_string(), "s".to_string()], &[], "a")
            .await
            .unwrap();
        col.update_note(nid, &["r2".to_string(), "s".to_string()], &[], "b::c")
            .await
            .unwrap();
        let note = col.get_note(nid).await.unwrap();
        assert_eq!(note.fields["Front"], "r2");
        assert_eq!(note.deck, "b::c");
    }

    #[tokio::test]
    async fn test_remove_notes() {
        let (_tmp, mut col) = scratch().await;
        let mid = col.id_for_name("Basic").unwrap();
        let nid = col
            .add_note(mid, &["r".to_string(), "s".to_string()], &[], "a")
            .await
            .unwrap();
        col.remove_notes(&[nid]).await.unwrap();
        assert!(col.find_notes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fields_check() {
        let (_tmp, mut col) = scratch().await;
        let mid = col.id_for_name("Basic").unwrap();
        let healthy = col
            .add_note(mid, &["r".to_string(), "s".to_string()], &[], "a")
            .await
            .unwrap();
        assert_eq!(
            col.fields_check(healthy).await.unwrap(),
            FieldsCheck::Normal
        );

        let empty = col
            .add_note(mid, &[String::new(), "s".to_string()], &[], "a")
            .await
            .unwrap();
        assert_eq!(col.fields_check(empty).await.unwrap(), FieldsCheck::Empty);

        let dup = col
            .add_note(mid, &["r".to_string(), "other".to_string()], &[], "a")
            .await
            .unwrap();
        assert_eq!(col.fields_check(dup).await.unwrap(), FieldsCheck::Duplicate);
    }

    #[tokio::test]
    async fn test_ensure_name_unique_appends_checksum() {
        let (_tmp, col) = scratch().await;
        let mut nt = basic_notetype();
        nt.id = 7;
        col.ensure_name_unique(&mut nt);
        assert_ne!(nt.name, "Basic");
        assert!(nt.name.starts_with("Basic-"));
    }

    #[tokio::test]
    async fn test_deck_id_creates_ancestors() {
        let (_tmp, mut col) = scratch().await;
        let did = col.deck_id("top::mid::leaf");
        assert_eq!(col.deck_name(did), Some("top::mid::leaf"));
        assert!(col.decks.values().any(|d| d.name == "top"));
        assert!(col.decks.values().any(|d| d.name == "top::mid"));
        // Idempotent.
        assert_eq!(col.deck_id("top::mid::leaf"), did);
    }

    #[tokio::test]
    async fn test_close_persists_models_and_decks() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("collection.anki2");
        let mut col = Collection::create(&path).await.unwrap();
        col.add_notetype(basic_notetype());
        col.deck_id("a");
        col.close().await.unwrap();

        let col_file = ExtantFile::check(&path).unwrap();
        let col = Collection::open(&col_file).await.unwrap();
        assert!(col.notetype_by_name("Basic").is_some());
        assert!(col.decks.values().any(|d| d.name == "a"));
        col.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("collection.anki2");
        let col = Collection::create(&path).await.unwrap();
        col.close().await.unwrap();

        let col_file = ExtantFile::check(&path).unwrap();
        let lock = CollectionLock::acquire(&col_file).await.unwrap();
        assert!(CollectionLock::acquire(&col_file).await.is_err());
        lock.release().await.unwrap();
        let lock = CollectionLock::acquire(&col_file).await.unwrap();
        lock.release().await.unwrap();
    }
}
