//! Local persistence of issued certificates.
//!
//! A bundle for `example.com` lives in two files of the storage directory:
//!
//! ```text
//! certificates/
//! ├── example.com.crt   PEM chain, mode 0644
//! └── example.com.key   PEM private key, mode 0600
//! ```

use std::{
    fs,
    io::{BufReader, Cursor, Write as _},
    path::{Path, PathBuf},
};

use der::{time::PrimitiveDateTime, Decode as _};
use time::OffsetDateTime;
use zeroize::Zeroizing;

use crate::{
    domain::Domain,
    error::{Error, Result},
};

const CERTIFICATE_MODE: u32 = 0o644;
const PRIVATE_KEY_MODE: u32 = 0o600;
const DIRECTORY_MODE: u32 = 0o755;

/// Certificate chain and private key issued for one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    domain: Domain,
    certificate: String,
    private_key: Zeroizing<String>,
    issued_at: OffsetDateTime,
}

impl CertificateBundle {
    pub(crate) fn new(domain: Domain, certificate: String, private_key: Zeroizing<String>) -> Self {
        CertificateBundle {
            domain,
            certificate,
            private_key,
            issued_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// The issued certificate chain in PEM format, leaf first.
    pub fn certificate(&self) -> &str {
        &self.certificate
    }

    /// The private key in PEM format.
    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    /// When the bundle was issued, or last written to disk for a loaded bundle.
    pub fn issued_at(&self) -> OffsetDateTime {
        self.issued_at
    }

    /// The issued certificate chain in DER format.
    pub fn certificate_chain(&self) -> Result<Vec<Vec<u8>>> {
        let mut rdr = BufReader::new(Cursor::new(self.certificate()));

        rustls_pemfile::certs(&mut rdr)
            .map(|res| res.map(|cert| cert.to_vec()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| Error::Crypto(format!("certificate chain: {err}")))
    }

    fn leaf(&self) -> Result<x509_cert::Certificate> {
        let chain = self.certificate_chain()?;
        let leaf = chain
            .first()
            .ok_or_else(|| Error::Crypto("no certificates in chain".to_owned()))?;

        Ok(x509_cert::Certificate::from_der(leaf)?)
    }

    /// Common Name of the leaf certificate's subject, if it has one.
    pub fn common_name(&self) -> Result<Option<String>> {
        let subject = self.leaf()?.tbs_certificate.subject.to_string();

        Ok(subject
            .split(',')
            .find_map(|rdn| rdn.trim().strip_prefix("CN="))
            .map(str::to_owned))
    }

    /// Inspect the certificate to count the number of (whole) valid days left.
    ///
    /// Let's Encrypt issues certificates valid for 90 days, so a fresh one reports 89.
    /// Expired certificates report negative days.
    pub fn valid_days_left(&self) -> Result<i64> {
        let not_after = self
            .leaf()?
            .tbs_certificate
            .validity
            .not_after
            .to_date_time();

        let not_after = PrimitiveDateTime::try_from(not_after)?.assume_utc();

        Ok((not_after - OffsetDateTime::now_utc()).whole_days())
    }
}

/// File system storage of [`CertificateBundle`]s, one pair of files per domain.
#[derive(Debug, Clone)]
pub struct CertificateStore {
    dir: PathBuf,
}

impl CertificateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CertificateStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Certificate and key file locations for `domain`.
    pub fn paths(&self, domain: &Domain) -> (PathBuf, PathBuf) {
        (
            self.dir.join(format!("{domain}.crt")),
            self.dir.join(format!("{domain}.key")),
        )
    }

    /// Writes both files of `bundle`, replacing any previous bundle for the domain.
    ///
    /// Both files are staged next to their destinations first. The previous pair is only
    /// replaced once both have been staged, so a failed write leaves it untouched.
    pub fn save(&self, bundle: &CertificateBundle) -> Result<(PathBuf, PathBuf)> {
        self.ensure_dir()?;

        let (cert_path, key_path) = self.paths(bundle.domain());

        let cert_tmp = stage(&cert_path, bundle.certificate().as_bytes(), CERTIFICATE_MODE)?;
        let key_tmp = match stage(&key_path, bundle.private_key().as_bytes(), PRIVATE_KEY_MODE) {
            Ok(tmp) => tmp,
            Err(err) => {
                discard(&cert_tmp);
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&cert_tmp, &cert_path) {
            discard(&cert_tmp);
            discard(&key_tmp);
            return Err(Error::io(&cert_path, err));
        }

        if let Err(err) = fs::rename(&key_tmp, &key_path) {
            discard(&key_tmp);
            // the new certificate does not match the old key
            if let Err(rm_err) = fs::remove_file(&cert_path) {
                log::warn!("Could not remove {}: {rm_err}", cert_path.display());
            }
            return Err(Error::io(&key_path, err));
        }

        log::info!(
            "Saved certificate for {} to {}",
            bundle.domain(),
            cert_path.display()
        );

        Ok((cert_path, key_path))
    }

    /// Reads the bundle stored for `domain`.
    pub fn load(&self, domain: &Domain) -> Result<CertificateBundle> {
        let (cert_path, key_path) = self.paths(domain);

        let certificate = read_artifact(&cert_path)?;
        let private_key = read_artifact(&key_path)?.map(Zeroizing::new);

        let (certificate, private_key) = match (certificate, private_key) {
            (None, None) => {
                return Err(Error::NotFound {
                    domain: domain.to_string(),
                })
            }
            (Some(cert), Some(key)) => (cert, key),
            (None, Some(_)) => return Err(incomplete(domain, cert_path)),
            (Some(_), None) => return Err(incomplete(domain, key_path)),
        };

        let issued_at = fs::metadata(&cert_path)
            .and_then(|meta| meta.modified())
            .map(OffsetDateTime::from)
            .map_err(|err| Error::io(&cert_path, err))?;

        Ok(CertificateBundle {
            domain: domain.clone(),
            certificate,
            private_key,
            issued_at,
        })
    }

    fn ensure_dir(&self) -> Result<()> {
        if self.dir.is_dir() {
            return Ok(());
        }

        log::debug!("Creating certificate directory {}", self.dir.display());
        fs::create_dir_all(&self.dir).map_err(|err| Error::io(&self.dir, err))?;
        set_mode(&self.dir, DIRECTORY_MODE)
    }
}

fn incomplete(domain: &Domain, path: PathBuf) -> Error {
    Error::IncompleteBundle {
        domain: domain.to_string(),
        path,
    }
}

/// Reads a bundle file, treating a missing or empty file as absent.
fn read_artifact(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) if contents.trim().is_empty() => Ok(None),
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(Error::io(path, err)),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{file_name}.tmp"))
}

/// Writes `contents` to a temporary sibling of `path`, returning the sibling's location.
fn stage(path: &Path, contents: &[u8], mode: u32) -> Result<PathBuf> {
    let tmp_path = tmp_path(path);

    let written = (|| {
        let mut file = fs::File::create(&tmp_path).map_err(|err| Error::io(&tmp_path, err))?;
        set_mode(&tmp_path, mode)?;
        file.write_all(contents).map_err(|err| Error::io(&tmp_path, err))?;
        file.sync_all().map_err(|err| Error::io(&tmp_path, err))
    })();

    match written {
        Ok(()) => Ok(tmp_path),
        Err(err) => {
            discard(&tmp_path);
            Err(err)
        }
    }
}

fn discard(tmp_path: &Path) {
    if tmp_path.is_file() {
        let _ = fs::remove_file(tmp_path);
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|err| Error::io(path, err))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::test::self_signed_pem;

    fn bundle(domain: &str) -> CertificateBundle {
        let (certificate, private_key) = self_signed_pem(domain);
        CertificateBundle::new(
            Domain::new(domain).unwrap(),
            certificate,
            Zeroizing::new(private_key),
        )
    }

    fn setup_store() -> (TempDir, CertificateStore) {
        let dir = TempDir::new().unwrap();
        let store = CertificateStore::new(dir.path().join("certificates"));
        (dir, store)
    }

    #[test]
    fn test_save_load_round_trip() {
        let (_dir, store) = setup_store();
        let bundle = bundle("example.com");

        let (cert_path, key_path) = store.save(&bundle).unwrap();
        assert!(cert_path.ends_with("certificates/example.com.crt"));
        assert!(key_path.ends_with("certificates/example.com.key"));

        let loaded = store.load(bundle.domain()).unwrap();
        assert_eq!(loaded.certificate(), bundle.certificate());
        assert_eq!(loaded.private_key(), bundle.private_key());
        assert_eq!(loaded.common_name().unwrap().as_deref(), Some("example.com"));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, store) = setup_store();
        let (cert_path, key_path) = store.save(&bundle("example.com")).unwrap();

        let mode = |path: &Path| fs::metadata(path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&cert_path), 0o644);
        assert_eq!(mode(&key_path), 0o600);
        assert_eq!(mode(store.dir()), 0o755);
    }

    #[test]
    fn test_load_missing_bundle() {
        let (_dir, store) = setup_store();
        let err = store.load(&Domain::new("example.com").unwrap()).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_load_half_written_bundle() {
        let (_dir, store) = setup_store();
        let bundle = bundle("example.com");
        let (_cert_path, key_path) = store.save(&bundle).unwrap();

        fs::remove_file(&key_path).unwrap();

        let err = store.load(bundle.domain()).unwrap_err();
        assert!(matches!(err, Error::IncompleteBundle { ref path, .. } if path == &key_path));
    }

    #[test]
    fn test_load_empty_certificate() {
        let (_dir, store) = setup_store();
        let bundle = bundle("example.com");
        let (cert_path, _key_path) = store.save(&bundle).unwrap();

        fs::write(&cert_path, "").unwrap();

        let err = store.load(bundle.domain()).unwrap_err();
        assert!(matches!(err, Error::IncompleteBundle { ref path, .. } if path == &cert_path));
    }

    #[test]
    fn test_save_overwrites_previous_bundle() {
        let (_dir, store) = setup_store();
        store.save(&bundle("example.com")).unwrap();

        let second = bundle("example.com");
        store.save(&second).unwrap();

        let loaded = store.load(second.domain()).unwrap();
        assert_eq!(loaded.certificate(), second.certificate());

        let leftovers = fs::read_dir(store.dir())
            .unwrap()
            .filter(|entry| {
                entry
                    .as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".tmp")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_failed_save_keeps_previous_bundle() {
        let (_dir, store) = setup_store();
        let first = bundle("example.com");
        store.save(&first).unwrap();

        // a directory in the way makes staging the key fail
        let (cert_path, key_path) = store.paths(first.domain());
        fs::create_dir(tmp_path(&key_path)).unwrap();

        let err = store.save(&bundle("example.com")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));

        assert!(!tmp_path(&cert_path).exists());

        let loaded = store.load(first.domain()).unwrap();
        assert_eq!(loaded.certificate(), first.certificate());
        assert_eq!(loaded.private_key(), first.private_key());
    }

    #[test]
    fn test_valid_days_left() {
        let bundle = bundle("example.com");
        let days = bundle.valid_days_left().unwrap();
        assert!(days > 0);
    }
}
