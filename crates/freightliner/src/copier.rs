//! Per-tag copy algorithm (§4.4 of the design doc): fetch the source
//! manifest, recurse into an index's child manifests, upload only the blobs
//! the destination doesn't already have, and write manifests child-first so
//! a destination reader never sees an index pointing at a missing child.

use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Instant;

use anyhow::Result;

use crate::error::RegistryError;
use crate::registry::RegistryClient;
use crate::stream::CancelableReader;
use crate::types::{Descriptor, ManifestRecord, TagOutcome, TagPlan};

pub struct Copier<'a> {
    source: &'a dyn RegistryClient,
    dest: &'a dyn RegistryClient,
    dry_run: bool,
    max_concurrent_blobs: usize,
    cancelled: Arc<AtomicBool>,
}

impl<'a> Copier<'a> {
    pub fn new(
        source: &'a dyn RegistryClient,
        dest: &'a dyn RegistryClient,
        dry_run: bool,
        max_concurrent_blobs: usize,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            source,
            dest,
            dry_run,
            max_concurrent_blobs,
            cancelled,
        }
    }

    /// Copy one {source-tag, dest-tag} pairing. Fetches the source manifest
    /// first so its digest is known before the skip-probe, per §4.4 step 1:
    /// returns `Ok(Skipped)` when the destination already carries that same
    /// digest and `force_overwrite` isn't set. Returns `Err` (never
    /// `Failed`) on a hard failure, leaving classification to the caller.
    pub fn copy_tag(&self, source_repo: &str, dest_repo: &str, plan: &TagPlan, force_overwrite: bool) -> Result<TagOutcome> {
        let start = Instant::now();

        let manifest = self.source.get_manifest(source_repo, &plan.source_tag)?;

        if !force_overwrite
            && let Ok(existing) = self.dest.get_manifest(dest_repo, &plan.dest_tag)
            && existing.digest == manifest.digest
        {
            return Ok(TagOutcome::Skipped);
        }

        let (manifest, bytes, layer_count) = self.copy_fetched_manifest(source_repo, dest_repo, manifest)?;

        if !self.dry_run {
            self.dest.put_manifest(dest_repo, &plan.dest_tag, &manifest)?;
        }

        Ok(TagOutcome::Replicated {
            bytes,
            duration_ms: start.elapsed().as_millis() as u64,
            layer_count,
        })
    }

    /// Fetch `reference` from the source and delegate to
    /// [`Self::copy_fetched_manifest`]. Used only for an index's children,
    /// where the manifest wasn't already in hand.
    fn copy_manifest_recursive(
        &self,
        source_repo: &str,
        dest_repo: &str,
        reference: &str,
    ) -> Result<(ManifestRecord, u64, u64)> {
        let manifest = self.source.get_manifest(source_repo, reference)?;
        self.copy_fetched_manifest(source_repo, dest_repo, manifest)
    }

    /// Recurse into an already-fetched manifest's index children before
    /// uploading any blobs, then write the manifest itself at its own
    /// digest (a caller writes the top-level tag reference separately).
    /// Returns the manifest back plus bytes actually transferred and the
    /// number of blob layers copied.
    fn copy_fetched_manifest(
        &self,
        source_repo: &str,
        dest_repo: &str,
        manifest: ManifestRecord,
    ) -> Result<(ManifestRecord, u64, u64)> {
        let mut bytes = 0u64;
        let mut layer_count = 0u64;

        if manifest.is_index() {
            for child in &manifest.manifest_refs {
                let (_, child_bytes, child_layers) =
                    self.copy_manifest_recursive(source_repo, dest_repo, &child.digest)?;
                bytes += child_bytes;
                layer_count += child_layers;
            }
        } else {
            bytes += self.copy_blobs_bounded(source_repo, dest_repo, &manifest.blob_refs)?;
            layer_count += manifest.blob_refs.len() as u64;
        }

        if !self.dry_run {
            self.dest
                .put_manifest(dest_repo, &manifest.digest, &manifest)?;
        }

        Ok((manifest, bytes, layer_count))
    }

    /// Copy `blobs` in chunks of at most `max_concurrent_blobs` at a time
    /// (§5 of the design doc: per-tag blob uploads are capped, not
    /// unbounded). Each chunk runs its blobs concurrently on borrowed
    /// threads and the next chunk only starts once the whole chunk
    /// finishes; the cancellation flag is checked between chunks so a
    /// cancel mid-tag stops new uploads from starting even though any
    /// already-spawned transfer in the current chunk runs to its own
    /// completion or its own cancellation.
    fn copy_blobs_bounded(&self, source_repo: &str, dest_repo: &str, blobs: &[Descriptor]) -> Result<u64> {
        if blobs.is_empty() {
            return Ok(0);
        }

        let total_bytes = AtomicU64::new(0);
        let first_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);
        let chunk_size = self.max_concurrent_blobs.max(1);

        for chunk in blobs.chunks(chunk_size) {
            if self.cancelled.load(Ordering::SeqCst) {
                anyhow::bail!(RegistryError::Cancelled);
            }

            thread::scope(|scope| {
                for descriptor in chunk {
                    scope.spawn(|| match self.copy_blob(source_repo, dest_repo, descriptor) {
                        Ok(n) => {
                            total_bytes.fetch_add(n, Ordering::SeqCst);
                        }
                        Err(err) => {
                            let mut slot = first_error.lock().unwrap();
                            if slot.is_none() {
                                *slot = Some(err);
                            }
                        }
                    });
                }
            });

            if first_error.lock().unwrap().is_some() {
                break;
            }
        }

        if let Some(err) = first_error.into_inner().unwrap() {
            return Err(err);
        }
        Ok(total_bytes.load(Ordering::SeqCst))
    }

    /// Copy one blob if the destination doesn't already have it, streaming
    /// the source's response body straight into the destination's upload
    /// body (no intermediate buffer) wrapped so the shared cancellation flag
    /// aborts the transfer at its next read. Returns the number of bytes
    /// actually transferred (0 when the blob already existed at the
    /// destination).
    fn copy_blob(&self, source_repo: &str, dest_repo: &str, descriptor: &Descriptor) -> Result<u64> {
        if self.dest.blob_exists(dest_repo, &descriptor.digest)? {
            return Ok(0);
        }

        if self.dry_run {
            return Ok(descriptor.size);
        }

        if self.cancelled.load(Ordering::SeqCst) {
            anyhow::bail!(RegistryError::Cancelled);
        }

        let reader = self.source.get_blob(source_repo, &descriptor.digest)?;
        let reader: Box<dyn Read + Send> = Box::new(CancelableReader::new(reader, self.cancelled.clone()));
        self.dest
            .put_blob(dest_repo, &descriptor.digest, descriptor.size, reader)?;
        Ok(descriptor.size)
    }
}
