use std::fs;
use std::path::Path;

use uuid::Uuid;

use pf_core::import_json;

use crate::error::{Result, StoreError};
use crate::store::Store;

impl Store {
    /// The stored v1 export of a run, as written by `pf_core::export_json`.
    pub fn export_run_json(&self, id: Uuid) -> Result<String> {
        let result = self.load_run(id)?;
        Ok(pf_core::export_json(&result)?)
    }

    /// Import a v1 JSON export as a new run.
    pub fn import_run_json(&self, json: &str) -> Result<Uuid> {
        let result =
            import_json(json).map_err(|e| StoreError::InvalidData(format!("invalid export: {e}")))?;
        self.save_run(&result)
    }

    pub fn export_run_file(&self, id: Uuid, path: &Path) -> Result<()> {
        let json = self.export_run_json(id)?;
        fs::write(path, json).map_err(|e| {
            StoreError::InvalidData(format!("failed to write {}: {e}", path.display()))
        })
    }

    pub fn import_run_file(&self, path: &Path) -> Result<Uuid> {
        let json = fs::read_to_string(path).map_err(|e| {
            StoreError::InvalidData(format!("failed to read {}: {e}", path.display()))
        })?;
        self.import_run_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf_core::{InputRecord, synthesize};

    fn make_json() -> String {
        let input = InputRecord {
            template: Some("rows = read(\"a\")\nfor r in rows:\n    f(r)\nfor s in rows:\n    g(s)\n".into()),
            ..InputRecord::new("bridge")
        };
        pf_core::export_json(&synthesize(&input).unwrap()).unwrap()
    }

    #[test]
    fn test_import_then_export() {
        let store = Store::open_in_memory().unwrap();
        let json = make_json();
        let id = store.import_run_json(&json).unwrap();

        let exported = store.export_run_json(id).unwrap();
        let a = import_json(&json).unwrap();
        let b = import_json(&exported).unwrap();
        assert_eq!(a.final_graph, b.final_graph);
        assert_eq!(a.certificate.rule_sequence(), b.certificate.rule_sequence());
    }

    #[test]
    fn test_import_rejects_garbage() {
        let store = Store::open_in_memory().unwrap();
        let err = store.import_run_json("{\"version\": 3}").unwrap_err();
        assert!(err.to_string().contains("invalid export"));
        assert!(store.list_runs().unwrap().is_empty());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let store = Store::open_in_memory().unwrap();
        let id = store.import_run_json(&make_json()).unwrap();

        store.export_run_file(id, &path).unwrap();
        let again = store.import_run_file(&path).unwrap();
        assert_ne!(again, id);
        assert_eq!(store.list_runs().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_file() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .import_run_file(Path::new("/nonexistent/run.json"))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));
    }
}
