use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use parking_lot::RwLock;
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::table::Table;
use crate::schema::schema::{validate_name, FieldSummary};

/// A directory of tables, one sub-directory per table.
pub struct Database {
    name: String,
    dir: PathBuf,
    config: Config,
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("name", &self.name).field("dir", &self.dir).finish_non_exhaustive()
    }
}

impl Database {
    pub fn create(dir: PathBuf, name: &str, config: &Config) -> Result<Self> {
        validate_name("database", name)?;
        if dir.exists() {
            return Err(Error::already_exists("database", name));
        }
        fs::create_dir_all(&dir)?;
        log::info!("created database {} in {}", name, dir.display());

        Ok(Database {
            name: name.to_string(),
            dir,
            config: config.clone(),
            tables: RwLock::new(HashMap::new()),
        })
    }

    /// Open every table found under `dir`.
    pub fn open(dir: PathBuf, name: &str, config: &Config) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::not_found("database", name));
        }

        let mut tables = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(table_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if !path.join(format!("{}.meta", table_name)).exists() {
                continue;
            }
            let table = Table::open(path, &table_name, config)?;
            tables.insert(table_name, Arc::new(table));
        }
        log::info!("opened database {} with {} tables", name, tables.len());

        Ok(Database {
            name: name.to_string(),
            dir,
            config: config.clone(),
            tables: RwLock::new(tables),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn create_table(&self, name: &str, primary_key: &str, fields: &[FieldSummary]) -> Result<Arc<Table>> {
        validate_name("table", name)?;
        let mut tables = self.tables.write();
        if tables.contains_key(name) {
            return Err(Error::already_exists("table", name));
        }
        let table = Arc::new(Table::create(self.dir.join(name), name, primary_key, fields, &self.config)?);
        tables.insert(name.to_string(), table.clone());
        Ok(table)
    }

    pub fn table(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("table", name))
    }

    pub fn list_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Forget the table and delete its directory.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let table = self
            .tables
            .write()
            .remove(name)
            .ok_or_else(|| Error::not_found("table", name))?;
        drop(table);
        fs::remove_dir_all(self.dir.join(name))?;
        log::info!("dropped table {}.{}", self.name, name);
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        for table in self.tables.read().values() {
            table.close()?;
        }
        Ok(())
    }
}
