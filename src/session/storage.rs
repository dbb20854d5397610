//! File-backed [`SessionStorage`].

// std
use std::{collections::BTreeMap, io::ErrorKind, path::PathBuf};
// crates.io
use async_trait::async_trait;
use tokio::{fs::OpenOptions, io::AsyncWriteExt};
// self
use crate::{
	_prelude::*,
	session::{ACCESS_TOKEN_STORAGE_KEY, SessionStorage},
};

/// Stores the access token in a JSON file readable only by the owner.
#[derive(Clone, Debug)]
pub struct FileSessionStorage {
	path: PathBuf,
}
impl FileSessionStorage {
	/// Use the file at `path`; it is created on first write.
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	async fn read_entries(&self) -> Result<BTreeMap<String, String>> {
		match tokio::fs::read(&self.path).await {
			Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
			Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
			Err(err) if err.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
			Err(err) => Err(err.into()),
		}
	}

	async fn write_entries(&self, entries: &BTreeMap<String, String>) -> Result<()> {
		let mut options = OpenOptions::new();

		options.create(true).truncate(true).write(true);

		#[cfg(unix)]
		options.mode(0o600);

		let mut file = options.open(&self.path).await?;
		let data = serde_json::to_vec_pretty(entries)?;

		file.write_all(&data).await?;
		file.flush().await?;

		Ok(())
	}
}
#[async_trait]
impl SessionStorage for FileSessionStorage {
	async fn store_access_token(&self, access_token: &str) -> Result<()> {
		let mut entries = self.read_entries().await?;

		entries.insert(ACCESS_TOKEN_STORAGE_KEY.to_owned(), access_token.to_owned());

		self.write_entries(&entries).await
	}

	async fn load_access_token(&self) -> Result<Option<String>> {
		Ok(self.read_entries().await?.remove(ACCESS_TOKEN_STORAGE_KEY))
	}

	async fn clear(&self) -> Result<()> {
		let mut entries = self.read_entries().await?;

		if entries.remove(ACCESS_TOKEN_STORAGE_KEY).is_some() {
			self.write_entries(&entries).await?;
		}

		Ok(())
	}
}
