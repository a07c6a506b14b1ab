//! Installer and key bundle packaging
//!
//! Customized installers are the platform's base installer with a
//! `seattle/seattle_repy/vesselinfo` entry appended. Linux and Mac bundles
//! are gzipped tarballs, Windows bundles are zip files.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

use crate::types::{ArchiveFormat, KeyKind, Platform, VESSEL_INFO_BUNDLE_PATH, VESSEL_INFO_FILENAME};
use crate::{Error, Result};

/// A finished installer archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagedInstaller {
    pub path: PathBuf,
    pub sha256: String,
}

/// Turns a prepared build directory into downloadable bundles
pub trait Packager: Send + Sync {
    /// Package installers for `platforms` from the build's vesselinfo file
    fn package(
        &self,
        build_dir: &Path,
        platforms: &[Platform],
    ) -> Result<BTreeMap<Platform, PackagedInstaller>>;

    /// Zip the build's public or private key files
    fn bundle_keys(&self, build_dir: &Path, kind: KeyKind) -> Result<PathBuf>;
}

/// Write the vesselinfo file into `dir`
pub fn write_vessel_info(dir: &Path, vessel_info: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(VESSEL_INFO_FILENAME);
    std::fs::write(&path, vessel_info)?;
    Ok(path)
}

/// Packager that rewrites base installer archives in-process
#[derive(Debug, Clone)]
pub struct ArchivePackager {
    base_installer_root: PathBuf,
}

impl ArchivePackager {
    pub fn new(base_installer_root: impl Into<PathBuf>) -> Self {
        Self {
            base_installer_root: base_installer_root.into(),
        }
    }

    fn base_installer(&self, platform: Platform) -> Result<PathBuf> {
        let path = self.base_installer_root.join(platform.bundle_name());
        if !path.is_file() {
            return Err(Error::not_found("base installer", path.display().to_string()));
        }
        Ok(path)
    }
}

impl Packager for ArchivePackager {
    fn package(
        &self,
        build_dir: &Path,
        platforms: &[Platform],
    ) -> Result<BTreeMap<Platform, PackagedInstaller>> {
        let vessel_info_path = build_dir.join(VESSEL_INFO_FILENAME);
        if !vessel_info_path.is_file() {
            return Err(Error::not_found(
                "vesselinfo",
                build_dir.display().to_string(),
            ));
        }
        let vessel_info = std::fs::read(&vessel_info_path)?;

        let mut packaged = BTreeMap::new();
        for &platform in platforms {
            let base = self.base_installer(platform)?;
            let dest = build_dir.join(platform.bundle_name());

            match platform.archive_format() {
                ArchiveFormat::TarGz => append_to_tgz(&base, &dest, &vessel_info)?,
                ArchiveFormat::Zip => append_to_zip(&base, &dest, &vessel_info)?,
            }

            let sha256 = file_sha256(&dest)?;
            info!(%platform, ?dest, "packaged installer");
            packaged.insert(platform, PackagedInstaller { path: dest, sha256 });
        }
        Ok(packaged)
    }

    fn bundle_keys(&self, build_dir: &Path, kind: KeyKind) -> Result<PathBuf> {
        let key_dir = build_dir.join(kind.directory());
        std::fs::create_dir_all(&key_dir)?;

        let dest = build_dir.join(kind.bundle_name());
        let tmp = NamedTempFile::new_in(build_dir)?;
        {
            let mut writer = zip::ZipWriter::new(tmp.as_file());
            let options = SimpleFileOptions::default().unix_permissions(0o644);

            for entry in WalkDir::new(&key_dir)
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                let name = format!(
                    "{}/{}",
                    kind.directory(),
                    entry.file_name().to_string_lossy()
                );
                writer.start_file(name, options)?;
                writer.write_all(&std::fs::read(entry.path())?)?;
            }
            writer.finish()?;
        }
        tmp.persist(&dest).map_err(|e| e.error)?;

        debug!(%kind, ?dest, "bundled keys");
        Ok(dest)
    }
}

fn append_to_tgz(base: &Path, dest: &Path, vessel_info: &[u8]) -> Result<()> {
    let tmp = NamedTempFile::new_in(parent_dir(dest))?;
    {
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(base)?));
        let mut builder = tar::Builder::new(GzEncoder::new(tmp.as_file(), Compression::default()));

        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            if path == Path::new(VESSEL_INFO_BUNDLE_PATH) {
                continue;
            }
            let mut header = entry.header().clone();
            builder.append_data(&mut header, &path, &mut entry)?;
        }

        let mut header = tar::Header::new_gnu();
        header.set_size(vessel_info.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
        header.set_cksum();
        builder.append_data(&mut header, VESSEL_INFO_BUNDLE_PATH, vessel_info)?;

        builder.into_inner()?.finish()?;
    }
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

fn append_to_zip(base: &Path, dest: &Path, vessel_info: &[u8]) -> Result<()> {
    let tmp = NamedTempFile::new_in(parent_dir(dest))?;
    {
        let mut archive = zip::ZipArchive::new(File::open(base)?)?;
        let mut writer = zip::ZipWriter::new(tmp.as_file());

        for i in 0..archive.len() {
            let file = archive.by_index_raw(i)?;
            if file.name() == VESSEL_INFO_BUNDLE_PATH {
                continue;
            }
            writer.raw_copy_file(file)?;
        }

        writer.start_file(
            VESSEL_INFO_BUNDLE_PATH,
            SimpleFileOptions::default().unix_permissions(0o644),
        )?;
        writer.write_all(vessel_info)?;
        writer.finish()?;
    }
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new("."))
}

/// SHA-256 of a file, hex encoded
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut file = File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Read;

    /// Create minimal base installers for every platform under `root`
    pub(crate) fn write_base_installers(root: &Path) {
        std::fs::create_dir_all(root).unwrap();
        for platform in Platform::ALL {
            let path = root.join(platform.bundle_name());
            let file = File::create(&path).unwrap();
            match platform.archive_format() {
                ArchiveFormat::TarGz => {
                    let mut builder =
                        tar::Builder::new(GzEncoder::new(file, Compression::default()));
                    let body = b"#!/bin/sh\necho install\n";
                    let mut header = tar::Header::new_gnu();
                    header.set_size(body.len() as u64);
                    header.set_mode(0o755);
                    header.set_cksum();
                    builder
                        .append_data(&mut header, "seattle/install.sh", &body[..])
                        .unwrap();
                    builder.into_inner().unwrap().finish().unwrap();
                }
                ArchiveFormat::Zip => {
                    let mut writer = zip::ZipWriter::new(file);
                    writer
                        .start_file("seattle/install.bat", SimpleFileOptions::default())
                        .unwrap();
                    writer.write_all(b"echo install\r\n").unwrap();
                    writer.finish().unwrap();
                }
            }
        }
    }

    fn tgz_entries(path: &Path) -> BTreeMap<String, String> {
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(path).unwrap()));
        let mut entries = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().to_string();
            let mut body = String::new();
            entry.read_to_string(&mut body).unwrap();
            entries.insert(name, body);
        }
        entries
    }

    fn zip_entries(path: &Path) -> BTreeMap<String, String> {
        let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut entries = BTreeMap::new();
        for i in 0..archive.len() {
            let mut file = archive.by_index(i).unwrap();
            let mut body = String::new();
            file.read_to_string(&mut body).unwrap();
            entries.insert(file.name().to_string(), body);
        }
        entries
    }

    #[test]
    fn test_package_all_platforms() {
        let base = tempfile::tempdir().unwrap();
        write_base_installers(base.path());
        let build = tempfile::tempdir().unwrap();
        write_vessel_info(build.path(), "Percent 80\nOwner abc").unwrap();

        let packager = ArchivePackager::new(base.path());
        let packaged = packager.package(build.path(), &Platform::ALL).unwrap();
        assert_eq!(packaged.len(), 3);

        let linux = tgz_entries(&packaged[&Platform::Linux].path);
        assert_eq!(linux[VESSEL_INFO_BUNDLE_PATH], "Percent 80\nOwner abc");
        assert!(linux.contains_key("seattle/install.sh"));

        let windows = zip_entries(&packaged[&Platform::Windows].path);
        assert_eq!(windows[VESSEL_INFO_BUNDLE_PATH], "Percent 80\nOwner abc");
        assert_eq!(windows["seattle/install.bat"], "echo install\r\n");

        let digest = &packaged[&Platform::Mac].sha256;
        assert_eq!(digest, &file_sha256(&packaged[&Platform::Mac].path).unwrap());
    }

    #[test]
    fn test_repackaging_replaces_vessel_info() {
        let base = tempfile::tempdir().unwrap();
        write_base_installers(base.path());
        let build = tempfile::tempdir().unwrap();
        let packager = ArchivePackager::new(base.path());

        write_vessel_info(build.path(), "Percent 80\nOwner old").unwrap();
        packager.package(build.path(), &[Platform::Linux]).unwrap();

        // a repackaged bundle is its own base here
        std::fs::copy(
            build.path().join(Platform::Linux.bundle_name()),
            base.path().join(Platform::Linux.bundle_name()),
        )
        .unwrap();
        write_vessel_info(build.path(), "Percent 80\nOwner new").unwrap();
        let packaged = packager.package(build.path(), &[Platform::Linux]).unwrap();

        let entries = tgz_entries(&packaged[&Platform::Linux].path);
        assert_eq!(entries[VESSEL_INFO_BUNDLE_PATH], "Percent 80\nOwner new");
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_missing_inputs() {
        let base = tempfile::tempdir().unwrap();
        let build = tempfile::tempdir().unwrap();
        let packager = ArchivePackager::new(base.path());

        // no vesselinfo yet
        assert!(matches!(
            packager.package(build.path(), &[Platform::Linux]),
            Err(Error::NotFound { .. })
        ));

        // no base installer
        write_vessel_info(build.path(), "Percent 80").unwrap();
        assert!(matches!(
            packager.package(build.path(), &[Platform::Windows]),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_bundle_keys() {
        let build = tempfile::tempdir().unwrap();
        let public_dir = build.path().join("public_keys");
        std::fs::create_dir_all(&public_dir).unwrap();
        std::fs::write(public_dir.join("alex.publickey"), "aa").unwrap();
        std::fs::write(public_dir.join("bill.publickey"), "bb").unwrap();

        let packager = ArchivePackager::new(build.path());
        let bundle = packager.bundle_keys(build.path(), KeyKind::Public).unwrap();
        assert_eq!(bundle, build.path().join("public_keys.zip"));

        let entries = zip_entries(&bundle);
        assert_eq!(entries["public_keys/alex.publickey"], "aa");
        assert_eq!(entries["public_keys/bill.publickey"], "bb");

        // no private keys yields an empty bundle
        let private = packager.bundle_keys(build.path(), KeyKind::Private).unwrap();
        assert!(zip_entries(&private).is_empty());
    }
}
