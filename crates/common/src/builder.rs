//! Build orchestration
//!
//! Turns a submitted build state into a build directory holding the
//! vesselinfo file and key material, and packages installers from it on
//! demand.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::BuilderConfig;
use crate::crypto::KeyPair;
use crate::db::Database;
use crate::keys::{DirectoryKeyProvider, KeyProvider};
use crate::packager::{self, ArchivePackager, PackagedInstaller, Packager};
use crate::partition::{PartitionLimits, Vessel};
use crate::session::BuildState;
use crate::types::{
    BuildRecord, BuildResults, BuiltUser, KeyKind, Platform, UserRecord, VESSEL_INFO_FILENAME,
};
use crate::validation::{self, ValidationError};
use crate::{Error, Result};

/// Per-user data accepted by the stateless build API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserData {
    #[serde(default)]
    pub public_key: Option<String>,
}

/// Download state of a prepared build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStatus {
    pub build_id: String,
    pub installers: BTreeMap<Platform, String>,
    /// SHA-256 of the installers packaged so far
    pub packaged: BTreeMap<Platform, String>,
    pub has_private_keys: bool,
    pub keys_downloaded: Vec<KeyKind>,
}

/// Outcome of cleaning the build root
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanReport {
    pub builds_scanned: usize,
    pub installers_removed: usize,
    pub builds_purged: usize,
}

/// Validates build data and produces custom installers
#[derive(Clone)]
pub struct BuildManager {
    db: Database,
    packager: Arc<dyn Packager>,
    build_root: PathBuf,
    base_url: String,
    reserved_public_key: String,
}

impl BuildManager {
    pub fn new(
        db: Database,
        packager: Arc<dyn Packager>,
        build_root: impl Into<PathBuf>,
        base_url: impl Into<String>,
        reserved_public_key: impl Into<String>,
    ) -> Self {
        Self {
            db,
            packager,
            build_root: build_root.into(),
            base_url: base_url.into(),
            reserved_public_key: reserved_public_key.into(),
        }
    }

    pub fn from_config(cfg: &BuilderConfig, db: Database) -> Result<Self> {
        let reserved_public_key = match &cfg.keys.reserved_public_key {
            Some(key) => key.clone(),
            None => KeyPair::load_or_generate(cfg.reserved_key_path())?.public_key_hex(),
        };
        let build_root = cfg.build_root();
        std::fs::create_dir_all(&build_root)?;

        Ok(Self::new(
            db,
            Arc::new(ArchivePackager::new(cfg.base_installer_root())),
            build_root,
            cfg.base_url.clone(),
            reserved_public_key,
        ))
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn limits(&self) -> PartitionLimits {
        self.db.limits()
    }

    /// Directory of a build, after checking the id is well formed
    pub fn build_dir(&self, build_id: &str) -> Result<PathBuf> {
        validation::validate_build_id(build_id)?;
        Ok(self.build_root.join(build_id))
    }

    fn existing_build_dir(&self, build_id: &str) -> Result<PathBuf> {
        let dir = self.build_dir(build_id)?;
        if !dir.join(VESSEL_INFO_FILENAME).is_file() {
            return Err(Error::not_found("build", build_id));
        }
        Ok(dir)
    }

    /// Validate `state`, write the vesselinfo file and provision keys
    pub fn prepare(&self, state: &BuildState) -> Result<BuildResults> {
        let users = collect_users(&state.users)?;
        let vessels = finalize_vessels(&state.vessels, self.limits())?;
        for vessel in &vessels {
            for name in vessel.owner.iter().chain(vessel.users.iter()) {
                if !users.contains_key(name.as_str()) {
                    return Err(ValidationError::UnknownUser(name.clone()).into());
                }
            }
        }

        let (build_id, build_dir) = self.allocate_build_dir()?;
        match self.populate(&build_id, &build_dir, &vessels, &users) {
            Ok(results) => {
                info!(build_id = %results.build_id, vessels = vessels.len(), "prepared build");
                Ok(results)
            }
            Err(e) => {
                warn!(%build_id, "build failed, removing directory: {}", e);
                if let Err(cleanup) = std::fs::remove_dir_all(&build_dir) {
                    warn!(%build_id, "failed to remove build directory: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    fn allocate_build_dir(&self) -> Result<(String, PathBuf)> {
        std::fs::create_dir_all(&self.build_root)?;
        loop {
            let build_id = hex::encode(rand::random::<[u8; 20]>());
            let dir = self.build_root.join(&build_id);
            // create_dir fails on collision, so a taken id is simply retried
            match std::fs::create_dir(&dir) {
                Ok(()) => return Ok((build_id, dir)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn populate(
        &self,
        build_id: &str,
        build_dir: &Path,
        vessels: &[Vessel],
        users: &BTreeMap<&str, Option<&str>>,
    ) -> Result<BuildResults> {
        let referenced: BTreeSet<&str> = vessels
            .iter()
            .flat_map(|v| v.owner.iter().chain(v.users.iter()))
            .map(String::as_str)
            .collect();

        let provider = DirectoryKeyProvider::new(build_dir);
        let mut built = BTreeMap::new();
        for name in referenced {
            let uploaded = users.get(name).copied().flatten();
            let key = provider.provision(name, uploaded)?;
            built.insert(
                name.to_string(),
                BuiltUser {
                    public_key: key.public_key,
                    has_private_key: key.private_key_path.is_some(),
                },
            );
        }

        let vessel_info = compile_vessel_info(
            vessels,
            &built,
            self.limits().reserved(),
            &self.reserved_public_key,
        )?;
        packager::write_vessel_info(build_dir, &vessel_info)?;

        self.db.insert_build(&BuildRecord {
            id: build_id.to_string(),
            vessels: vessels.to_vec(),
            users: built.clone(),
            keys_downloaded: Vec::new(),
            created_at: chrono::Utc::now().timestamp(),
        })?;

        Ok(BuildResults {
            build_id: build_id.to_string(),
            installers: self.urls_for(build_id),
            users: built,
        })
    }

    fn urls_for(&self, build_id: &str) -> BTreeMap<Platform, String> {
        let base = self.base_url.trim_end_matches('/');
        Platform::ALL
            .iter()
            .map(|p| (*p, format!("{}/download/{}/installers/{}", base, build_id, p)))
            .collect()
    }

    /// Download URLs for a build's installers. They package on first request.
    pub fn installer_urls(&self, build_id: &str) -> Result<BTreeMap<Platform, String>> {
        self.existing_build_dir(build_id)?;
        Ok(self.urls_for(build_id))
    }

    pub fn installer_exists(&self, build_id: &str, platform: Platform) -> Result<bool> {
        Ok(self
            .build_dir(build_id)?
            .join(platform.bundle_name())
            .is_file())
    }

    /// The installer and its digest, packaging it first if needed
    pub fn package(&self, build_id: &str, platform: Platform) -> Result<PackagedInstaller> {
        let dir = self.existing_build_dir(build_id)?;
        if self.installer_exists(build_id, platform)? {
            let path = dir.join(platform.bundle_name());
            let sha256 = packager::file_sha256(&path)?;
            return Ok(PackagedInstaller { path, sha256 });
        }
        let mut packaged = self.packager.package(&dir, &[platform])?;
        packaged
            .remove(&platform)
            .ok_or_else(|| Error::Packaging(format!("no {} installer produced", platform)))
    }

    /// Bundle a build's keys and record the download
    pub fn key_bundle(&self, build_id: &str, kind: KeyKind) -> Result<PathBuf> {
        let dir = self.existing_build_dir(build_id)?;
        if self.db.get_build(build_id)?.is_none() {
            return Err(Error::not_found("build", build_id));
        }
        let bundle = self.packager.bundle_keys(&dir, kind)?;
        self.db.mark_keys_downloaded(build_id, kind)?;
        Ok(bundle)
    }

    pub fn status(&self, build_id: &str) -> Result<BuildStatus> {
        let installers = self.installer_urls(build_id)?;
        let record = self
            .db
            .get_build(build_id)?
            .ok_or_else(|| Error::not_found("build", build_id))?;
        let mut packaged = BTreeMap::new();
        for platform in Platform::ALL {
            if self.installer_exists(build_id, platform)? {
                let path = self.build_dir(build_id)?.join(platform.bundle_name());
                packaged.insert(platform, packager::file_sha256(&path)?);
            }
        }
        Ok(BuildStatus {
            build_id: build_id.to_string(),
            installers,
            packaged,
            has_private_keys: record.has_private_keys(),
            keys_downloaded: record.keys_downloaded,
        })
    }

    /// Remove packaged installers so they are rebuilt on request.
    /// With `purge`, remove every trace of the builds.
    pub fn clean(&self, purge: bool) -> Result<CleanReport> {
        let mut report = CleanReport::default();
        if !self.build_root.is_dir() {
            return Ok(report);
        }

        for entry in WalkDir::new(&self.build_root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let dir = entry.path();
            // directories without a vesselinfo file are not builds
            if !entry.file_type().is_dir() || !dir.join(VESSEL_INFO_FILENAME).is_file() {
                continue;
            }
            report.builds_scanned += 1;

            if purge {
                std::fs::remove_dir_all(dir)?;
                self.db.delete_build(&entry.file_name().to_string_lossy())?;
                report.builds_purged += 1;
                continue;
            }

            for platform in Platform::ALL {
                let installer = dir.join(platform.bundle_name());
                if installer.is_file() {
                    std::fs::remove_file(&installer)?;
                    report.installers_removed += 1;
                }
            }
        }

        info!(?report, purge, "cleaned build root");
        Ok(report)
    }
}

/// Build a state from the stateless API's vessel list and user data.
///
/// Users referenced by vessels but absent from `user_data` get generated keys.
pub fn state_from_request(vessels: Vec<Vessel>, user_data: BTreeMap<String, UserData>) -> BuildState {
    let mut users: Vec<UserRecord> = user_data
        .into_iter()
        .map(|(name, data)| UserRecord {
            name,
            public_key: data.public_key,
        })
        .collect();
    for vessel in &vessels {
        for name in vessel.owner.iter().chain(vessel.users.iter()) {
            if !users.iter().any(|u| &u.name == name) {
                users.push(UserRecord::new(name.clone()));
            }
        }
    }
    BuildState { vessels, users }
}

fn collect_users(users: &[UserRecord]) -> Result<BTreeMap<&str, Option<&str>>> {
    let mut map = BTreeMap::new();
    for user in users {
        validation::validate_username(&user.name)?;
        if let Some(key) = &user.public_key {
            validation::validate_public_key(key)?;
        }
        if map
            .insert(user.name.as_str(), user.public_key.as_deref())
            .is_some()
        {
            return Err(ValidationError::DuplicateUsername(user.name.clone()).into());
        }
    }
    Ok(map)
}

/// Check ownership and fold empty vessels into their neighbours.
///
/// An empty vessel goes to the preceding vessel; empty vessels at the front
/// go to the first vessel that is kept.
pub fn finalize_vessels(vessels: &[Vessel], limits: PartitionLimits) -> Result<Vec<Vessel>> {
    if let Some(index) = vessels
        .iter()
        .position(|v| v.owner.is_none() && !v.users.is_empty())
    {
        return Err(ValidationError::VesselWithoutOwner { index }.into());
    }
    if vessels.iter().all(|v| v.owner.is_none()) {
        return Err(ValidationError::NoOwner.into());
    }
    // folding only moves shares around, so a valid input keeps sums in range
    let percentages: Vec<u32> = vessels.iter().map(|v| v.percentage).collect();
    validation::validate_vessel_percentages(&percentages, limits.total)?;

    let mut finalized: Vec<Vessel> = Vec::with_capacity(vessels.len());
    let mut leading = 0;
    for vessel in vessels {
        if vessel.is_empty() {
            match finalized.last_mut() {
                Some(prev) => prev.percentage += vessel.percentage,
                None => leading += vessel.percentage,
            }
            continue;
        }
        let mut vessel = vessel.clone();
        vessel.percentage += std::mem::take(&mut leading);
        let mut seen = BTreeSet::new();
        vessel.users.retain(|u| seen.insert(u.clone()));
        finalized.push(vessel);
    }

    if finalized.len() > limits.max_vessels {
        return Err(ValidationError::TooManyVessels {
            max: limits.max_vessels,
            got: finalized.len(),
        }
        .into());
    }
    Ok(finalized)
}

fn key_of<'a>(users: &'a BTreeMap<String, BuiltUser>, name: &str) -> Result<&'a str> {
    users
        .get(name)
        .map(|u| u.public_key.as_str())
        .ok_or_else(|| ValidationError::UnknownUser(name.to_string()).into())
}

/// Render the vesselinfo file: one `Percent`/`Owner`/`User` block per vessel,
/// then the reserved vessel.
pub fn compile_vessel_info(
    vessels: &[Vessel],
    users: &BTreeMap<String, BuiltUser>,
    reserved_percentage: u32,
    reserved_public_key: &str,
) -> Result<String> {
    let mut lines = Vec::new();
    for vessel in vessels {
        let owner = vessel.owner.as_deref().ok_or(ValidationError::NoOwner)?;
        lines.push(format!("Percent {}", vessel.percentage));
        lines.push(format!("Owner {}", key_of(users, owner)?));
        for user in &vessel.users {
            lines.push(format!("User {}", key_of(users, user)?));
        }
    }
    lines.push(format!("Percent {}", reserved_percentage));
    lines.push(format!("Owner {}", reserved_public_key));

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packager::tests::write_base_installers;

    struct Fixture {
        _dir: tempfile::TempDir,
        manager: BuildManager,
        reserved: String,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        write_base_installers(&base);
        let reserved = KeyPair::generate().public_key_hex();
        let db = Database::open_memory(PartitionLimits::default()).unwrap();
        let manager = BuildManager::new(
            db,
            Arc::new(ArchivePackager::new(&base)),
            dir.path().join("builds"),
            "http://builder.test/",
            reserved.clone(),
        );
        Fixture {
            _dir: dir,
            manager,
            reserved,
        }
    }

    fn sample_state() -> BuildState {
        BuildState {
            vessels: vec![
                Vessel::new(50).with_owner("alex").with_user("bill"),
                Vessel::new(30).with_owner("bill"),
            ],
            users: vec![UserRecord::new("alex"), UserRecord::new("bill")],
        }
    }

    fn built_user(key: &str) -> BuiltUser {
        BuiltUser {
            public_key: key.to_string(),
            has_private_key: false,
        }
    }

    #[test]
    fn test_compile_vessel_info() {
        let mut users = BTreeMap::new();
        users.insert("alex".to_string(), built_user("AAA"));
        users.insert("bill".to_string(), built_user("BBB"));
        let vessels = sample_state().vessels;

        let info = compile_vessel_info(&vessels, &users, 20, "RRR").unwrap();
        assert_eq!(
            info,
            "Percent 50\nOwner AAA\nUser BBB\nPercent 30\nOwner BBB\nPercent 20\nOwner RRR"
        );
    }

    #[test]
    fn test_finalize_merges_empty_vessels() {
        let limits = PartitionLimits::default();
        let vessels = vec![
            Vessel::new(10),
            Vessel::new(20).with_owner("alex"),
            Vessel::new(30),
            Vessel::new(20).with_owner("bill"),
        ];
        let finalized = finalize_vessels(&vessels, limits).unwrap();
        let shares: Vec<u32> = finalized.iter().map(|v| v.percentage).collect();
        assert_eq!(shares, vec![60, 20]);
    }

    #[test]
    fn test_finalize_requires_owners() {
        let limits = PartitionLimits::default();
        let err = finalize_vessels(&[Vessel::new(80)], limits).unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::NoOwner)));

        let vessels = vec![
            Vessel::new(40).with_owner("alex"),
            Vessel::new(40).with_user("bill"),
        ];
        let err = finalize_vessels(&vessels, limits).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::VesselWithoutOwner { index: 1 })
        ));
    }

    #[test]
    fn test_finalize_checks_total() {
        let err = finalize_vessels(
            &[Vessel::new(70).with_owner("alex")],
            PartitionLimits::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::PercentageTotal {
                required: 80,
                current: 70
            })
        ));
    }

    #[test]
    fn test_finalize_rejects_oversized_shares() {
        let limits = PartitionLimits::default();
        let vessels = vec![
            Vessel::new(100).with_owner("alex"),
            Vessel::new(u32::MAX - 19),
        ];
        let err = finalize_vessels(&vessels, limits).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::InvalidPercentage(p)) if p == u32::MAX - 19
        ));

        let vessels = vec![Vessel::new(150).with_owner("alex"), Vessel::new(10)];
        assert!(matches!(
            finalize_vessels(&vessels, limits),
            Err(Error::Validation(ValidationError::InvalidPercentage(150)))
        ));
    }

    #[test]
    fn test_prepare_writes_build() {
        let f = fixture();
        let uploaded = KeyPair::generate().public_key_hex();
        let mut state = sample_state();
        state.users[1].public_key = Some(uploaded.clone());

        let results = f.manager.prepare(&state).unwrap();
        assert_eq!(results.build_id.len(), 40);
        assert!(validation::validate_build_id(&results.build_id).is_ok());
        assert_eq!(
            results.installers[&Platform::Linux],
            format!("http://builder.test/download/{}/installers/linux", results.build_id)
        );
        assert!(results.users["alex"].has_private_key);
        assert!(!results.users["bill"].has_private_key);
        assert_eq!(results.users["bill"].public_key, uploaded);

        let dir = f.manager.build_dir(&results.build_id).unwrap();
        let info = std::fs::read_to_string(dir.join("vesselinfo")).unwrap();
        let alex = &results.users["alex"].public_key;
        assert_eq!(
            info,
            format!(
                "Percent 50\nOwner {alex}\nUser {uploaded}\nPercent 30\nOwner {uploaded}\nPercent 20\nOwner {}",
                f.reserved
            )
        );
        assert!(dir.join("private_keys").join("alex.privatekey").is_file());

        let status = f.manager.status(&results.build_id).unwrap();
        assert!(status.has_private_keys);
        assert!(status.keys_downloaded.is_empty());
    }

    #[test]
    fn test_prepare_rejects_unknown_and_bad_users() {
        let f = fixture();
        let mut state = sample_state();
        state.users.pop();
        let err = f.manager.prepare(&state).unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::UnknownUser(_))));

        let mut state = sample_state();
        state.users.push(UserRecord::new("alex"));
        assert!(f.manager.prepare(&state).is_err());

        let mut state = sample_state();
        state.users[0].public_key = Some("12 34".to_string());
        let err = f.manager.prepare(&state).unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::InvalidPublicKey)));
    }

    #[test]
    fn test_package_on_demand() {
        let f = fixture();
        let results = f.manager.prepare(&sample_state()).unwrap();
        let id = &results.build_id;

        assert!(!f.manager.installer_exists(id, Platform::Windows).unwrap());
        assert!(f.manager.status(id).unwrap().packaged.is_empty());

        let installer = f.manager.package(id, Platform::Windows).unwrap();
        assert!(installer.path.is_file());
        assert_eq!(installer.sha256, packager::file_sha256(&installer.path).unwrap());
        assert!(f.manager.installer_exists(id, Platform::Windows).unwrap());

        // second request reuses the archive
        assert_eq!(f.manager.package(id, Platform::Windows).unwrap(), installer);

        let status = f.manager.status(id).unwrap();
        assert_eq!(status.packaged.len(), 1);
        assert_eq!(status.packaged[&Platform::Windows], installer.sha256);

        let unknown = "0".repeat(40);
        assert!(matches!(
            f.manager.package(&unknown, Platform::Linux),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            f.manager.package("../../etc", Platform::Linux),
            Err(Error::Validation(ValidationError::InvalidBuildId))
        ));
    }

    #[test]
    fn test_key_bundle_marks_download() {
        let f = fixture();
        let results = f.manager.prepare(&sample_state()).unwrap();
        let bundle = f.manager.key_bundle(&results.build_id, KeyKind::Private).unwrap();
        assert!(bundle.ends_with("private_keys.zip"));

        let status = f.manager.status(&results.build_id).unwrap();
        assert_eq!(status.keys_downloaded, vec![KeyKind::Private]);
    }

    #[test]
    fn test_clean_and_purge() {
        let f = fixture();
        let first = f.manager.prepare(&sample_state()).unwrap();
        let second = f.manager.prepare(&sample_state()).unwrap();
        f.manager.package(&first.build_id, Platform::Linux).unwrap();
        f.manager.package(&first.build_id, Platform::Mac).unwrap();

        let report = f.manager.clean(false).unwrap();
        assert_eq!(report.builds_scanned, 2);
        assert_eq!(report.installers_removed, 2);
        assert!(!f.manager.installer_exists(&first.build_id, Platform::Linux).unwrap());
        assert!(f.manager.status(&first.build_id).is_ok());

        let report = f.manager.clean(true).unwrap();
        assert_eq!(report.builds_purged, 2);
        assert!(f.manager.status(&second.build_id).is_err());
        assert!(f.manager.db().get_build(&second.build_id).unwrap().is_none());
    }

    #[test]
    fn test_state_from_request_adds_referenced_users() {
        let uploaded = KeyPair::generate().public_key_hex();
        let mut user_data = BTreeMap::new();
        user_data.insert(
            "alex".to_string(),
            UserData {
                public_key: Some(uploaded.clone()),
            },
        );
        let state = state_from_request(sample_state().vessels, user_data);
        assert_eq!(state.users.len(), 2);
        assert_eq!(state.users[0].public_key.as_deref(), Some(uploaded.as_str()));
        assert_eq!(state.users[1], UserRecord::new("bill"));
    }
}
