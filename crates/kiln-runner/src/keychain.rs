//! Read-only store over a build's SSH keys.
//!
//! Each key is a file named after the key. A synthetic [`CONFIG`] file
//! holds the companion config blocks of every key, in key order, and is
//! meant to be installed as `~/.ssh/config`.

use std::io::{Cursor, Read, Seek, SeekFrom};
use std::sync::Arc;

use kiln_core::store::{FileInfo, Record, RecordState, Store, StoreError, StoreResult};
use kiln_state::model::Key;

pub const CONFIG: &str = "config";

#[derive(Debug, Clone, Default)]
pub struct KeyChain {
    keys: Arc<Vec<Key>>,
}

impl KeyChain {
    pub fn new(keys: Vec<Key>) -> Self {
        Self {
            keys: Arc::new(keys),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Every file name in the chain, keys first, then [`CONFIG`].
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.keys.iter().map(|k| k.name.clone()).collect();
        names.push(CONFIG.to_string());
        names
    }

    /// Body of the synthetic config file.
    pub fn config(&self) -> String {
        let mut out = String::new();
        for key in self.keys.iter() {
            let block = key.config.trim_end();
            if block.is_empty() {
                continue;
            }
            out.push_str(block);
            out.push('\n');
        }
        out
    }

    fn contents(&self, name: &str) -> Option<Vec<u8>> {
        if name == CONFIG {
            return Some(self.config().into_bytes());
        }
        self.keys
            .iter()
            .find(|k| k.name == name)
            .map(|k| k.key.clone().into_bytes())
    }
}

impl Store for KeyChain {
    fn init(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Keys belong to a single build; every partition is the chain itself.
    fn partition(&self, _key: i64) -> Arc<dyn Store> {
        Arc::new(self.clone())
    }

    fn create(&self, name: &str) -> StoreResult<Box<dyn Record>> {
        Err(StoreError::path("create", name, StoreError::Permission))
    }

    fn open(&self, name: &str) -> StoreResult<Box<dyn Record>> {
        let data = self
            .contents(name)
            .ok_or_else(|| StoreError::path("open", name, StoreError::NotExist))?;
        Ok(Box::new(KeyRecord {
            name: name.to_string(),
            data: Cursor::new(data),
            state: RecordState::default(),
        }))
    }

    fn remove(&self, name: &str) -> StoreResult<()> {
        Err(StoreError::path("remove", name, StoreError::Permission))
    }

    fn stat(&self, name: &str) -> StoreResult<FileInfo> {
        let data = self
            .contents(name)
            .ok_or_else(|| StoreError::path("stat", name, StoreError::NotExist))?;
        Ok(FileInfo {
            name: name.to_string(),
            size: data.len() as u64,
            modified: None,
        })
    }

    fn limit(&self) -> u64 {
        0
    }
}

struct KeyRecord {
    name: String,
    data: Cursor<Vec<u8>>,
    state: RecordState,
}

impl Record for KeyRecord {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, buf: &mut [u8]) -> StoreResult<usize> {
        self.state.check()?;
        Ok(self.data.read(buf)?)
    }

    fn write(&mut self, _buf: &[u8]) -> StoreResult<usize> {
        self.state.check()?;
        Err(StoreError::Permission)
    }

    fn seek(&mut self, pos: SeekFrom) -> StoreResult<u64> {
        self.state.check()?;
        Ok(self.data.seek(pos)?)
    }

    fn close(&mut self) -> StoreResult<()> {
        self.state.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> KeyChain {
        KeyChain::new(vec![
            Key {
                id: 1,
                build_id: 9,
                name: "deploy".into(),
                key: "-----BEGIN KEY-----\nabc\n".into(),
                config: "Host deploy.example.com\n  IdentityFile ~/.ssh/deploy\n".into(),
            },
            Key {
                id: 2,
                build_id: 9,
                name: "mirror".into(),
                key: "xyz".into(),
                config: String::new(),
            },
        ])
    }

    #[test]
    fn keys_and_config_are_readable() {
        let chain = chain();
        assert_eq!(chain.names(), ["deploy", "mirror", "config"]);

        let mut out = Vec::new();
        chain.place("mirror", &mut out).unwrap();
        assert_eq!(out, b"xyz");

        let mut out = Vec::new();
        chain.place(CONFIG, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Host deploy.example.com\n  IdentityFile ~/.ssh/deploy\n"
        );
        assert_eq!(chain.stat("mirror").unwrap().size, 3);
    }

    #[test]
    fn chain_is_read_only() {
        let chain = chain();
        assert!(chain.create("new").err().unwrap().is_permission());
        assert!(chain.remove("deploy").unwrap_err().is_permission());
        assert!(chain.collect("x", &mut &b"data"[..]).unwrap_err().is_permission());

        let mut rec = chain.open("deploy").unwrap();
        assert!(rec.write(b"x").unwrap_err().is_permission());
        rec.close().unwrap();
        assert!(rec.close().unwrap_err().is_closed());
    }

    #[test]
    fn unknown_names_do_not_exist() {
        assert!(chain().open("nope").err().unwrap().is_not_exist());
        assert!(chain().stat("nope").unwrap_err().is_not_exist());
    }
}
