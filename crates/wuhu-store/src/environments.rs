// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use rusqlite::{params, OptionalExtension};

use crate::db::Store;
use crate::error::{Result, StoreError};
use crate::types::{EnvironmentKind, EnvironmentRecord};

fn kind_to_str(kind: EnvironmentKind) -> &'static str {
    match kind {
        EnvironmentKind::Local => "local",
        EnvironmentKind::Template => "template",
        EnvironmentKind::Sandbox => "sandbox",
    }
}

fn kind_from_str(s: &str) -> Result<EnvironmentKind> {
    match s {
        "local" => Ok(EnvironmentKind::Local),
        "template" => Ok(EnvironmentKind::Template),
        "sandbox" => Ok(EnvironmentKind::Sandbox),
        other => Err(StoreError::StoreIntegrity(format!("unknown environment kind {other}"))),
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, String, Option<String>, Option<String>)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

impl Store {
    pub async fn create_environment(&self, record: EnvironmentRecord) -> Result<EnvironmentRecord> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO environments (id, name, kind, path, template_path, startup_script)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id,
                    record.name,
                    kind_to_str(record.kind),
                    record.path,
                    record.template_path,
                    record.startup_script,
                ],
            )?;
            Ok(record)
        })
        .await
    }

    pub async fn get_environment(&self, id_or_name: &str) -> Result<EnvironmentRecord> {
        let key = id_or_name.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, name, kind, path, template_path, startup_script
                     FROM environments WHERE id = ?1 OR name = ?1",
                    params![key],
                    row_to_record,
                )
                .optional()?
                .ok_or_else(|| StoreError::not_found(format!("environment {key}")))?;
            let (id, name, kind, path, template_path, startup_script) = row;
            Ok(EnvironmentRecord { id, name, kind: kind_from_str(&kind)?, path, template_path, startup_script })
        })
        .await
    }

    pub async fn list_environments(&self) -> Result<Vec<EnvironmentRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, kind, path, template_path, startup_script FROM environments ORDER BY name",
            )?;
            let rows = stmt.query_map([], row_to_record)?;
            let mut out = Vec::new();
            for row in rows {
                let (id, name, kind, path, template_path, startup_script) = row?;
                out.push(EnvironmentRecord { id, name, kind: kind_from_str(&kind)?, path, template_path, startup_script });
            }
            Ok(out)
        })
        .await
    }

    pub async fn update_environment(&self, record: EnvironmentRecord) -> Result<EnvironmentRecord> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE environments SET name = ?2, kind = ?3, path = ?4, template_path = ?5, startup_script = ?6
                 WHERE id = ?1",
                params![
                    record.id,
                    record.name,
                    kind_to_str(record.kind),
                    record.path,
                    record.template_path,
                    record.startup_script,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found(format!("environment {}", record.id)));
            }
            Ok(record)
        })
        .await
    }

    pub async fn delete_environment(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute("DELETE FROM environments WHERE id = ?1", params![id])?;
            if changed == 0 {
                return Err(StoreError::not_found(format!("environment {id}")));
            }
            Ok(())
        })
        .await
    }
}
