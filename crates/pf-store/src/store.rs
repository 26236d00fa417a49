use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use pf_core::{
    Alternative, AppliedRule, Certificate, SynthesisResult, Termination, export_json, import_json,
};

use crate::error::{Result, StoreError};
use crate::schema;

pub struct Store {
    conn: Connection,
}

/// One row of the run listing.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub id: Uuid,
    pub task: String,
    pub created_at: String,
    pub initial_energy: f64,
    pub final_energy: f64,
    pub generations: usize,
    pub termination: Termination,
    pub core_count: u32,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // --- Save ---

    /// Persist a run under a fresh id. The full result is stored as a v1
    /// export; certificate entries are also written row by row.
    pub fn save_run(&self, result: &SynthesisResult) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let export = export_json(result)?;
        let termination = serde_json::to_string(&result.termination)?;

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO runs (id, task, initial_energy, final_energy, generations, termination, core_count, export)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id.to_string(),
                result.task,
                result.initial_energy,
                result.final_energy,
                result.generations as i64,
                termination,
                result.core_count,
                export,
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO certificate_entries
                 (run_id, generation_index, previous_energy, selected_energy, rules_applied, alternatives)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for entry in result.certificate.entries() {
                stmt.execute(params![
                    id.to_string(),
                    entry.generation_index as i64,
                    entry.previous_energy,
                    entry.selected_energy,
                    serde_json::to_string(&entry.rules_applied)?,
                    serde_json::to_string(&entry.alternatives)?,
                ])?;
            }
        }
        tx.commit()?;

        tracing::info!(
            run = %id,
            generations = result.generations,
            entries = result.certificate.len(),
            "saved run"
        );
        Ok(id)
    }

    // --- Load ---

    /// The stored result. The `core_count` column wins over the export so
    /// runs saved before the export carried it still replay.
    pub fn load_run(&self, id: Uuid) -> Result<SynthesisResult> {
        let row: Option<(String, u32)> = self
            .conn
            .query_row(
                "SELECT export, core_count FROM runs WHERE id = ?1",
                [id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (export, core_count) =
            row.ok_or_else(|| StoreError::InvalidData(format!("run not found: {id}")))?;
        let mut result = import_json(&export)
            .map_err(|e| StoreError::InvalidData(format!("run {id} has a corrupt export: {e}")))?;
        result.core_count = core_count.max(1);
        Ok(result)
    }

    /// Newest first.
    pub fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, task, created_at, initial_energy, final_energy, generations, termination, core_count
             FROM runs ORDER BY created_at DESC, rowid DESC",
        )?;
        #[allow(clippy::type_complexity)]
        let rows: Vec<(String, String, String, f64, f64, i64, String, u32)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        rows.into_iter()
            .map(
                |(id, task, created_at, initial_energy, final_energy, generations, termination, core_count)| {
                    Ok(RunSummary {
                        id: parse_uuid(&id)?,
                        task,
                        created_at,
                        initial_energy,
                        final_energy,
                        generations: generations.max(0) as usize,
                        termination: serde_json::from_str(&termination)?,
                        core_count,
                    })
                },
            )
            .collect()
    }

    /// Rebuild a run's certificate from its entry rows alone.
    pub fn load_certificate(&self, id: Uuid) -> Result<Certificate> {
        let energies: Option<(f64, f64)> = self
            .conn
            .query_row(
                "SELECT initial_energy, final_energy FROM runs WHERE id = ?1",
                [id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (initial_energy, final_energy) =
            energies.ok_or_else(|| StoreError::InvalidData(format!("run not found: {id}")))?;

        let mut stmt = self.conn.prepare(
            "SELECT generation_index, previous_energy, selected_energy, rules_applied, alternatives
             FROM certificate_entries WHERE run_id = ?1 ORDER BY generation_index",
        )?;
        let rows: Vec<(i64, f64, f64, String, String)> = stmt
            .query_map([id.to_string()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut certificate = Certificate::new(initial_energy);
        for (index, previous, selected, applied, alternatives) in rows {
            let applied: Vec<AppliedRule> = serde_json::from_str(&applied)?;
            let alternatives: Vec<Alternative> = serde_json::from_str(&alternatives)?;
            let assigned = certificate.record(previous, selected, applied, alternatives);
            if assigned as i64 != index {
                return Err(StoreError::InvalidData(format!(
                    "run {id}: certificate has a gap before generation {index}"
                )));
            }
        }
        certificate.final_energy = final_energy;
        Ok(certificate)
    }

    /// Resolve a full id or an unambiguous id prefix.
    pub fn resolve_run_id(&self, text: &str) -> Result<Uuid> {
        if let Ok(id) = Uuid::parse_str(text) {
            return Ok(id);
        }
        if text.is_empty() || !text.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            return Err(StoreError::InvalidData(format!("invalid run id '{text}'")));
        }
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM runs WHERE id LIKE ?1 || '%' LIMIT 2")?;
        let matches: Vec<String> = stmt
            .query_map([text.to_ascii_lowercase()], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        match matches.as_slice() {
            [only] => parse_uuid(only),
            [] => Err(StoreError::InvalidData(format!("run not found: {text}"))),
            _ => Err(StoreError::InvalidData(format!("run id prefix '{text}' is ambiguous"))),
        }
    }

    pub fn delete_run(&self, id: Uuid) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM runs WHERE id = ?1", [id.to_string()])?;
        Ok(rows > 0)
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::InvalidData(format!("invalid UUID '{s}': {e}")))
}
