//! Domain records: stored files, component models, and appearance links.

use serde::{Deserialize, Serialize};

use super::{
    current_timestamp_ms, decode_doc, get_doc, put_doc, DbError, ReviewDb, APPEARANCE_SEP,
};

/// One physically stored document, keyed by its SHA-256 content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_hash: String,
    pub filename: String,
    pub source_url: Option<String>,
    pub size_bytes: u64,
    pub local_path: String,
    pub created_at_ms: i64,
}

/// Human-review state of a model record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    Unverified,
    Verified,
}

/// A usage-domain label. `text` keeps the original casing; `canon` is the
/// trimmed, lowercased form used for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppTag {
    pub text: String,
    pub canon: String,
}

impl AppTag {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let canon = canonical_tag(&text);
        Self { text, canon }
    }
}

/// Canonical form of a tag: trimmed and lowercased.
pub fn canonical_tag(text: &str) -> String {
    text.trim().to_lowercase()
}

/// A component model number's canonical specification, independent of which
/// file(s) mention it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub model_number: String,

    pub input_voltage_range: Option<String>,
    pub output_voltage: Option<String>,
    pub output_power: Option<String>,
    pub package: Option<String>,
    pub isolation: Option<String>,
    pub insulation: Option<String>,
    pub dimension: Option<String>,

    pub verify_status: VerifyStatus,
    pub reviewer: Option<String>,
    pub reviewed_at_ms: Option<i64>,
    pub notes: Option<String>,

    pub applications: Vec<AppTag>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl ModelRecord {
    #[must_use]
    pub fn new(model_number: impl Into<String>) -> Self {
        let model_number = model_number.into();
        debug_assert!(!model_number.is_empty());
        let now_ms = current_timestamp_ms();
        Self {
            model_number,
            input_voltage_range: None,
            output_voltage: None,
            output_power: None,
            package: None,
            isolation: None,
            insulation: None,
            dimension: None,
            verify_status: VerifyStatus::Unverified,
            reviewer: None,
            reviewed_at_ms: None,
            notes: None,
            applications: Vec::new(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }
}

fn appearance_key(file_hash: &str, model_number: &str) -> String {
    format!("{file_hash}{APPEARANCE_SEP}{model_number}")
}

fn file_prefix(file_hash: &str) -> String {
    format!("{file_hash}{APPEARANCE_SEP}")
}

impl ReviewDb {
    pub fn get_file(&self, file_hash: &str) -> Result<Option<FileRecord>, DbError> {
        let rtxn = self.env().read_txn()?;
        get_doc(self.files_db(), &rtxn, file_hash)
    }

    /// Insert the record unless a row with this hash already exists. Returns
    /// the stored row either way; re-ingestion of known content never
    /// rewrites filename or source.
    pub fn upsert_file(&self, record: &FileRecord) -> Result<FileRecord, DbError> {
        debug_assert!(!record.file_hash.is_empty());
        let mut wtxn = self.env().write_txn()?;
        if let Some(raw) = self.files_db().get(&wtxn, record.file_hash.as_str())? {
            let existing: FileRecord = decode_doc(raw)?;
            return Ok(existing);
        }
        put_doc(self.files_db(), &mut wtxn, record.file_hash.as_str(), record)?;
        wtxn.commit()?;
        Ok(record.clone())
    }

    /// Delete a file row and cascade its appearance links.
    pub fn delete_file(&self, file_hash: &str) -> Result<bool, DbError> {
        let mut wtxn = self.env().write_txn()?;
        let existed = self.files_db().delete(&mut wtxn, file_hash)?;
        let keys = {
            let prefix = file_prefix(file_hash);
            let mut keys = Vec::new();
            for entry in self.appearances_db().prefix_iter(&wtxn, &prefix)? {
                let (key, ()) = entry?;
                keys.push(key.to_string());
            }
            keys
        };
        for key in keys {
            self.appearances_db().delete(&mut wtxn, &key)?;
        }
        wtxn.commit()?;
        Ok(existed)
    }

    pub fn list_files(&self) -> Result<Vec<FileRecord>, DbError> {
        let rtxn = self.env().read_txn()?;
        let mut out = Vec::new();
        for entry in self.files_db().iter(&rtxn)? {
            let (_, raw) = entry?;
            out.push(decode_doc(raw)?);
        }
        Ok(out)
    }

    pub fn get_model(&self, model_number: &str) -> Result<Option<ModelRecord>, DbError> {
        let rtxn = self.env().read_txn()?;
        get_doc(self.models_db(), &rtxn, model_number)
    }

    pub fn put_model(&self, record: &ModelRecord) -> Result<(), DbError> {
        debug_assert!(!record.model_number.is_empty());
        let mut wtxn = self.env().write_txn()?;
        put_doc(
            self.models_db(),
            &mut wtxn,
            record.model_number.as_str(),
            record,
        )?;
        wtxn.commit()?;
        Ok(())
    }

    /// Delete a model row and cascade its appearance links.
    pub fn delete_model(&self, model_number: &str) -> Result<bool, DbError> {
        let mut wtxn = self.env().write_txn()?;
        let existed = self.models_db().delete(&mut wtxn, model_number)?;
        let suffix = format!("{APPEARANCE_SEP}{model_number}");
        let keys = {
            let mut keys = Vec::new();
            for entry in self.appearances_db().iter(&wtxn)? {
                let (key, ()) = entry?;
                if key.ends_with(&suffix) {
                    keys.push(key.to_string());
                }
            }
            keys
        };
        for key in keys {
            self.appearances_db().delete(&mut wtxn, &key)?;
        }
        wtxn.commit()?;
        Ok(existed)
    }

    /// Ensure the (file, model) appearance link exists. Returns true when the
    /// link was newly created.
    pub fn ensure_appearance(&self, file_hash: &str, model_number: &str) -> Result<bool, DbError> {
        let key = appearance_key(file_hash, model_number);
        let mut wtxn = self.env().write_txn()?;
        if self.appearances_db().get(&wtxn, &key)?.is_some() {
            return Ok(false);
        }
        self.appearances_db().put(&mut wtxn, &key, &())?;
        wtxn.commit()?;
        Ok(true)
    }

    pub fn appearance_exists(&self, file_hash: &str, model_number: &str) -> Result<bool, DbError> {
        let rtxn = self.env().read_txn()?;
        let key = appearance_key(file_hash, model_number);
        Ok(self.appearances_db().get(&rtxn, &key)?.is_some())
    }

    /// Model numbers recorded as appearing in one file, in key order.
    pub fn list_file_models(&self, file_hash: &str) -> Result<Vec<String>, DbError> {
        let rtxn = self.env().read_txn()?;
        let prefix = file_prefix(file_hash);
        let mut out = Vec::new();
        for entry in self.appearances_db().prefix_iter(&rtxn, &prefix)? {
            let (key, ()) = entry?;
            out.push(key[prefix.len()..].to_string());
        }
        Ok(out)
    }

    /// Remove every appearance link for one file, keeping model rows intact.
    pub fn clear_file_appearances(&self, file_hash: &str) -> Result<usize, DbError> {
        let mut wtxn = self.env().write_txn()?;
        let prefix = file_prefix(file_hash);
        let keys = {
            let mut keys = Vec::new();
            for entry in self.appearances_db().prefix_iter(&wtxn, &prefix)? {
                let (key, ()) = entry?;
                keys.push(key.to_string());
            }
            keys
        };
        let removed = keys.len();
        for key in keys {
            self.appearances_db().delete(&mut wtxn, &key)?;
        }
        wtxn.commit()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::AppPaths;
    use tempfile::TempDir;

    fn open_db() -> (TempDir, ReviewDb) {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let db = ReviewDb::open(&paths).expect("open db");
        (temp, db)
    }

    fn file_record(hash: &str) -> FileRecord {
        FileRecord {
            file_hash: hash.to_string(),
            filename: "converter.pdf".to_string(),
            source_url: Some("https://example.com/converter.pdf".to_string()),
            size_bytes: 42,
            local_path: format!("/tmp/store/{hash}.pdf"),
            created_at_ms: current_timestamp_ms(),
        }
    }

    #[test]
    fn upsert_file_keeps_first_metadata() {
        let (_temp, db) = open_db();
        let first = file_record("aa11");
        db.upsert_file(&first).expect("first upsert");

        let mut second = file_record("aa11");
        second.filename = "renamed.pdf".to_string();
        let stored = db.upsert_file(&second).expect("second upsert");

        assert_eq!(stored.filename, "converter.pdf");
        let fetched = db.get_file("aa11").expect("get").expect("present");
        assert_eq!(fetched.filename, "converter.pdf");
    }

    #[test]
    fn appearance_links_are_unique_and_listable() {
        let (_temp, db) = open_db();
        assert!(db.ensure_appearance("aa11", "PX-100").expect("link"));
        assert!(!db.ensure_appearance("aa11", "PX-100").expect("relink"));
        assert!(db.ensure_appearance("aa11", "PX-200").expect("second link"));

        let models = db.list_file_models("aa11").expect("list");
        assert_eq!(models, vec!["PX-100".to_string(), "PX-200".to_string()]);
    }

    #[test]
    fn deleting_file_cascades_appearances() {
        let (_temp, db) = open_db();
        db.upsert_file(&file_record("bb22")).expect("upsert");
        db.ensure_appearance("bb22", "PX-100").expect("link");
        db.ensure_appearance("cc33", "PX-100").expect("other link");

        assert!(db.delete_file("bb22").expect("delete"));

        assert!(db.list_file_models("bb22").expect("list").is_empty());
        assert!(db.appearance_exists("cc33", "PX-100").expect("check"));
    }

    #[test]
    fn deleting_model_cascades_appearances() {
        let (_temp, db) = open_db();
        db.put_model(&ModelRecord::new("PX-100")).expect("put model");
        db.ensure_appearance("aa11", "PX-100").expect("link");
        db.ensure_appearance("bb22", "PX-100").expect("link");
        db.ensure_appearance("aa11", "PX-200").expect("other model");

        assert!(db.delete_model("PX-100").expect("delete"));

        assert!(!db.appearance_exists("aa11", "PX-100").expect("check"));
        assert!(!db.appearance_exists("bb22", "PX-100").expect("check"));
        assert!(db.appearance_exists("aa11", "PX-200").expect("check"));
    }

    #[test]
    fn canonical_tag_trims_and_lowercases() {
        assert_eq!(canonical_tag(" Automotive "), "automotive");
        assert_eq!(AppTag::new("Rail Transport").canon, "rail transport");
    }
}
