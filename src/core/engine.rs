use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use parking_lot::RwLock;
use crate::core::config::Config;
use crate::core::database::Database;
use crate::core::error::{Error, Result};
use crate::schema::schema::validate_name;

/// Root of all databases under `config.data_dir`.
pub struct Engine {
    config: Config,
    databases: RwLock<HashMap<String, Arc<Database>>>,
}

impl Engine {
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        config.apply_log_level()?;
        fs::create_dir_all(&config.data_dir)?;

        let mut databases = HashMap::new();
        for entry in fs::read_dir(&config.data_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if validate_name("database", &name).is_err() {
                continue;
            }
            let database = Database::open(path, &name, &config)?;
            databases.insert(name, Arc::new(database));
        }

        Ok(Engine {
            config,
            databases: RwLock::new(databases),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn create_database(&self, name: &str) -> Result<Arc<Database>> {
        validate_name("database", name)?;
        let mut databases = self.databases.write();
        if databases.contains_key(name) {
            return Err(Error::already_exists("database", name));
        }
        let database = Arc::new(Database::create(self.config.data_dir.join(name), name, &self.config)?);
        databases.insert(name.to_string(), database.clone());
        Ok(database)
    }

    pub fn database(&self, name: &str) -> Result<Arc<Database>> {
        self.databases
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("database", name))
    }

    pub fn list_databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn drop_database(&self, name: &str) -> Result<()> {
        let database = self
            .databases
            .write()
            .remove(name)
            .ok_or_else(|| Error::not_found("database", name))?;
        let dir = database.dir().to_path_buf();
        drop(database);
        fs::remove_dir_all(&dir)?;
        log::info!("dropped database {}", name);
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        for database in self.databases.read().values() {
            database.close()?;
        }
        Ok(())
    }
}
