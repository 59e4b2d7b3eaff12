//! Host wide configuration: web server configs, SSL material and firewall rules.

use std::path::{Path, PathBuf};

use super::{copy_file, Outcome, Unit, UnitError};
use crate::config::SystemPaths;
use crate::host::Certificate;
use crate::util::archive::{self, Compression};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ItemKind {
    /// A directory tree, staged as a gzip compressed tarball.
    Tree,
    /// A single file, staged as is.
    File,
}

/// A system wide configuration item staged at a fixed location.
///
/// Items whose source doesn't exist on the host are skipped.
#[derive(Debug, Clone)]
pub struct SystemItem {
    staged: &'static str,
    source: PathBuf,
    kind: ItemKind,
}

impl SystemItem {
    /// All items collected by a full backup.
    pub fn all(paths: &SystemPaths) -> Vec<Self> {
        let tree = |staged, source: &Path| Self {
            staged,
            source: source.to_path_buf(),
            kind: ItemKind::Tree,
        };
        let file = |staged, source: &Path| Self {
            staged,
            source: source.to_path_buf(),
            kind: ItemKind::File,
        };

        vec![
            tree("configs/nginx.tar.gz", &paths.nginx),
            tree("configs/apache2.tar.gz", &paths.apache2),
            tree("ssl/selfsigned.tar.gz", &paths.ssl),
            tree("ssl/letsencrypt.tar.gz", &paths.letsencrypt),
            file("firewall/rules.v4", &paths.firewall_v4),
            file("firewall/rules.v6", &paths.firewall_v6),
        ]
    }
}

impl Unit for SystemItem {
    type Error = UnitError;

    fn label(&self) -> String {
        self.staged.to_string()
    }

    fn collect(&self, staging: &Path) -> Result<Outcome, Self::Error> {
        let staged = staging.join(self.staged);
        match self.kind {
            ItemKind::Tree if self.source.is_dir() => {
                if let Some(parent) = staged.parent() {
                    std::fs::create_dir_all(parent).map_err(UnitError::io(parent))?;
                }
                archive::create_archive(&self.source, &staged, Compression::Gzip)?;
            }
            ItemKind::File if self.source.is_file() => copy_file(&self.source, &staged)?,
            _ => {
                log::debug!(target: "backend::system", "Skipping {}, {} doesn't exist", self.staged, self.source.display());
                return Ok(Outcome::Absent);
            }
        }

        log::info!(target: "backend::system", "Collected {} from {}", self.staged, self.source.display());
        Ok(Outcome::Done)
    }

    fn restore(&self, staging: &Path) -> Result<Outcome, Self::Error> {
        let staged = staging.join(self.staged);
        if !staged.is_file() {
            return Ok(Outcome::Absent);
        }

        match self.kind {
            ItemKind::Tree => {
                archive::extract_archive(&staged, &self.source, Compression::Gzip)?;
            }
            ItemKind::File => copy_file(&staged, &self.source)?,
        }

        log::info!(target: "backend::system", "Restored {} to {}", self.staged, self.source.display());
        Ok(Outcome::Done)
    }
}

/// Certificate and key of a single domain, staged as `ssl/<domain>.crt` and
/// `ssl/<domain>.key`.
#[derive(Debug, Clone)]
pub struct DomainCertificate {
    domain: String,
    /// Where the host keeps the certificate, if it has one.
    located: Option<Certificate>,
    ssl_dir: PathBuf,
}

impl DomainCertificate {
    pub fn new(domain: &str, located: Option<Certificate>, ssl_dir: &Path) -> Self {
        Self {
            domain: domain.to_string(),
            located,
            ssl_dir: ssl_dir.to_path_buf(),
        }
    }

    fn staged(&self, staging: &Path) -> Certificate {
        let ssl = staging.join("ssl");
        Certificate {
            cert: ssl.join(format!("{}.crt", self.domain)),
            key: ssl.join(format!("{}.key", self.domain)),
        }
    }
}

impl Unit for DomainCertificate {
    type Error = UnitError;

    fn label(&self) -> String {
        format!("certificate {}", self.domain)
    }

    fn collect(&self, staging: &Path) -> Result<Outcome, Self::Error> {
        let Some(located) = &self.located else {
            log::debug!(target: "backend::system", "No certificate found for {}", self.domain);
            return Ok(Outcome::Absent);
        };

        let staged = self.staged(staging);
        copy_file(&located.cert, &staged.cert)?;
        if located.key.is_file() {
            copy_file(&located.key, &staged.key)?;
        }

        Ok(Outcome::Done)
    }

    fn restore(&self, staging: &Path) -> Result<Outcome, Self::Error> {
        let staged = self.staged(staging);
        if !staged.cert.is_file() {
            return Ok(Outcome::Absent);
        }

        let dest = self.located.clone().unwrap_or_else(|| Certificate {
            cert: self.ssl_dir.join(format!("{}.crt", self.domain)),
            key: self.ssl_dir.join(format!("{}.key", self.domain)),
        });
        log::info!(target: "backend::system", "Restore certificate of {} to {}", self.domain, dest.cert.display());
        copy_file(&staged.cert, &dest.cert)?;
        if staged.key.is_file() {
            copy_file(&staged.key, &dest.key)?;
        }

        Ok(Outcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn paths(root: &Path) -> SystemPaths {
        SystemPaths {
            nginx: root.join("nginx"),
            apache2: root.join("apache2"),
            ssl: root.join("ssl"),
            letsencrypt: root.join("letsencrypt"),
            firewall_v4: root.join("iptables/rules.v4"),
            firewall_v6: root.join("iptables/rules.v6"),
        }
    }

    #[test]
    fn missing_sources_are_skipped() {
        let host = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let paths = paths(host.path());
        fs::create_dir_all(paths.nginx.join("sites-enabled")).unwrap();
        fs::write(paths.nginx.join("sites-enabled/default"), "server {}").unwrap();
        fs::create_dir_all(paths.firewall_v4.parent().unwrap()).unwrap();
        fs::write(&paths.firewall_v4, "*filter\nCOMMIT\n").unwrap();

        let outcomes: Vec<_> = SystemItem::all(&paths)
            .iter()
            .map(|item| item.collect(staging.path()).unwrap())
            .collect();

        assert_eq!(
            outcomes,
            [
                Outcome::Done,
                Outcome::Absent,
                Outcome::Absent,
                Outcome::Absent,
                Outcome::Done,
                Outcome::Absent
            ]
        );
        assert!(staging.path().join("configs/nginx.tar.gz").is_file());
        assert!(staging.path().join("firewall/rules.v4").is_file());
    }

    #[test]
    fn restores_items_to_their_source() {
        let host = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let paths = paths(host.path());
        fs::create_dir_all(&paths.apache2).unwrap();
        fs::write(paths.apache2.join("apache2.conf"), "ServerName localhost").unwrap();
        fs::create_dir_all(paths.firewall_v6.parent().unwrap()).unwrap();
        fs::write(&paths.firewall_v6, "*filter\nCOMMIT\n").unwrap();

        let items = SystemItem::all(&paths);
        for item in &items {
            item.collect(staging.path()).unwrap();
        }
        fs::remove_dir_all(&paths.apache2).unwrap();
        fs::write(&paths.firewall_v6, "").unwrap();

        for item in &items {
            item.restore(staging.path()).unwrap();
        }
        assert_eq!(
            fs::read_to_string(paths.apache2.join("apache2.conf")).unwrap(),
            "ServerName localhost"
        );
        assert_eq!(fs::read_to_string(&paths.firewall_v6).unwrap(), "*filter\nCOMMIT\n");
    }

    #[test]
    fn certificate_falls_back_to_ssl_dir() {
        let host = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let live = host.path().join("letsencrypt/live/example.com");
        fs::create_dir_all(&live).unwrap();
        fs::write(live.join("fullchain.pem"), "CERT").unwrap();
        fs::write(live.join("privkey.pem"), "KEY").unwrap();
        let located = Certificate {
            cert: live.join("fullchain.pem"),
            key: live.join("privkey.pem"),
        };

        let ssl_dir = host.path().join("ssl");
        DomainCertificate::new("example.com", Some(located), &ssl_dir)
            .collect(staging.path())
            .unwrap();
        assert_eq!(
            fs::read_to_string(staging.path().join("ssl/example.com.key")).unwrap(),
            "KEY"
        );

        let outcome = DomainCertificate::new("example.com", None, &ssl_dir)
            .restore(staging.path())
            .unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(fs::read_to_string(ssl_dir.join("example.com.crt")).unwrap(), "CERT");
    }

    #[test]
    fn domain_without_certificate_is_absent() {
        let staging = tempfile::tempdir().unwrap();
        let unit = DomainCertificate::new("example.com", None, Path::new("/nonexistent"));

        assert_eq!(unit.collect(staging.path()).unwrap(), Outcome::Absent);
        assert_eq!(unit.restore(staging.path()).unwrap(), Outcome::Absent);
    }
}
