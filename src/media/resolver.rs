//! Resource resolver: media reference -> file URL, plus reachability probe.
//!
//! File URLs follow the record store's file-serving convention:
//! `<base>/api/files/<collectionId>/<recordId>/<fileName>`.

use std::time::Duration;

use tracing::{debug, warn};
use url::Url;

use super::reference::{MediaReference, ResolvedMedia};
use crate::error::ViewerError;

/// Default budget for the existence probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Resolver {
    base: Url,
    client: reqwest::Client,
    probe_timeout: Duration,
}

impl Resolver {
    /// `base` must be a hierarchical URL (http/https).
    pub fn new(base: Url, client: reqwest::Client) -> Result<Self, ViewerError> {
        if base.cannot_be_a_base() {
            return Err(ViewerError::InvalidReference(format!(
                "backend URL cannot hold paths: {}",
                base
            )));
        }
        Ok(Self {
            base,
            client,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        })
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Build the file URL. Pure: no I/O, same input gives the same URL.
    pub fn resolve(&self, reference: &MediaReference) -> Result<Url, ViewerError> {
        let fields = [
            ("collectionId", &reference.collection_id),
            ("recordId", &reference.record_id),
            ("fileName", &reference.file_name),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(ViewerError::InvalidReference(format!("{} is empty", name)));
            }
        }

        let mut url = self.base.clone();
        url.set_query(None);
        url.set_fragment(None);
        url.path_segments_mut()
            .map_err(|_| ViewerError::InvalidReference("backend URL cannot hold paths".into()))?
            .pop_if_empty()
            .extend([
                "api",
                "files",
                reference.collection_id.as_str(),
                reference.record_id.as_str(),
                reference.file_name.as_str(),
            ]);
        Ok(url)
    }

    /// HEAD the URL. Any 2xx is reachable; every failure is `false`.
    pub async fn probe(&self, url: &Url) -> bool {
        let result = self
            .client
            .head(url.clone())
            .timeout(self.probe_timeout)
            .send()
            .await;
        match result {
            Ok(resp) => {
                let ok = resp.status().is_success();
                debug!(%url, status = %resp.status(), reachable = ok, "Probed media file");
                ok
            }
            Err(e) => {
                warn!(%url, "Media probe failed: {}", e);
                false
            }
        }
    }

    /// Resolve and probe in one step. Unreachable files are an error.
    pub async fn resolve_and_probe(
        &self,
        reference: &MediaReference,
    ) -> Result<ResolvedMedia, ViewerError> {
        let url = self.resolve(reference)?;
        let mut media = ResolvedMedia::unprobed(url.as_str());
        let reachable = self.probe(&url).await;
        media.mark_probed(reachable);
        if !reachable {
            return Err(ViewerError::UnreachableResource {
                url: url.to_string(),
            });
        }
        Ok(media)
    }
}
