//! One-shot object-store handles for the cloud storage sink.
//!
//! A handle is built from the base URI for every write and dropped right
//! after it, so the sink never holds a long-lived storage connection.

use bytes::Bytes;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use url::Url;

use crate::error::{Error, Result};

pub struct ExportStorage {
    store: Box<dyn ObjectStore>,
    prefix: Path,
}

impl ExportStorage {
    /// Open a handle for `base`. `nodelocal` URIs address the node's local
    /// filesystem; everything else (s3, gs, azure, http/https, file) goes
    /// through the object-store URL dispatch.
    pub fn from_uri(base: &Url) -> Result<Self> {
        if base.scheme() == "nodelocal" {
            let local = Url::parse(&format!("file://{}", base.path()))
                .map_err(|e| Error::Storage(format!("invalid nodelocal path: {e}")))?;
            return Self::from_uri(&local);
        }
        let (store, prefix) = object_store::parse_url(base)?;
        Ok(Self { store, prefix })
    }

    /// Write `contents` as `name` under the base prefix. The object is
    /// durable at the destination when this returns.
    pub async fn write_file(&self, name: &str, contents: Bytes) -> Result<()> {
        let name = Path::parse(name).map_err(|e| Error::Storage(e.to_string()))?;
        let path: Path = self.prefix.parts().chain(name.parts()).collect();
        self.store.put(&path, PutPayload::from(contents)).await?;
        Ok(())
    }
}
