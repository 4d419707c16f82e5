//! The entropy source. Randomness comes from the operating system; a device opened before the
//! root directory changed serves as a fallback when the system source fails.
use crate::error::Error;
use super::ManagerKind;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Default fallback device.
pub const RANDOM_DEVICE: &str = "/dev/urandom";

/// An open handle on a random device.
#[derive(Clone, Debug)]
pub struct FallbackEntropy {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl FallbackEntropy {
    /// # Errors
    ///
    /// Returns the underlying IO error if the device can't be opened.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fill(&self, buf: &mut [u8]) -> io::Result<()> {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .read_exact(buf)
    }
}

#[derive(Clone, Debug)]
pub struct EntropySource {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    fallback: Option<FallbackEntropy>,
}

impl EntropySource {
    pub(super) fn create(fallback: Option<FallbackEntropy>) -> Result<Self, Error> {
        let source = Self {
            inner: Arc::new(Inner { fallback }),
        };
        let mut sample = [0u8; 8];
        source.fill(&mut sample)?;
        Ok(source)
    }

    /// Fill `buf` with random bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ManagerCreate`] when neither the system source nor the fallback device
    /// can supply randomness.
    pub fn fill(&self, buf: &mut [u8]) -> Result<(), Error> {
        let os_err = match OsRng.try_fill_bytes(buf) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        match &self.inner.fallback {
            Some(fallback) => fallback.fill(buf).map_err(|e| {
                Error::ManagerCreate(
                    ManagerKind::Entropy,
                    format!("{os_err}; {}: {e}", fallback.path().display()),
                )
            }),
            None => Err(Error::ManagerCreate(
                ManagerKind::Entropy,
                os_err.to_string(),
            )),
        }
    }

    /// # Errors
    ///
    /// As for [`EntropySource::fill`].
    pub fn next_u64(&self) -> Result<u64, Error> {
        let mut buf = [0u8; 8];
        self.fill(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    #[must_use]
    pub fn has_fallback(&self) -> bool {
        self.inner.fallback.is_some()
    }

    pub(super) fn destroy(self) {
        tracing::debug!(fallback = self.has_fallback(), "entropy source destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_distinct_values() {
        let entropy = EntropySource::create(None).unwrap();
        assert_ne!(entropy.next_u64().unwrap(), entropy.next_u64().unwrap());
        assert!(!entropy.has_fallback());
    }

    #[test]
    fn fallback_device_reads() {
        let fallback = FallbackEntropy::open(RANDOM_DEVICE).unwrap();
        let mut buf = [0u8; 32];
        fallback.fill(&mut buf).unwrap();
        assert!(buf.iter().any(|b| *b != 0));
        let entropy = EntropySource::create(Some(fallback)).unwrap();
        assert!(entropy.has_fallback());
    }

    #[test]
    fn missing_fallback_device() {
        assert!(FallbackEntropy::open("/nonexistent/urandom").is_err());
    }
}
