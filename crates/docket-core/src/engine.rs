use crate::concurrency::{shutdown_requested, BuildLock};
use crate::record::BuildRecord;
use crate::CoreError;
use docket_fetch::{
    fetch_and_verify, fetch_overlay, install, prepare_image, resolve_all, ArtifactSource,
    BuildPlan, CommandRunner, ImagePreparation, InstalledArtifact, MirrorSource, OverlayReport,
    PackageRunner, SourceRouter, VerifiedArtifact,
};
use docket_schema::{parse_manifest_file, ArchTarget, BuildManifest, ContainerConfig};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Runs image builds for one validated manifest.
///
/// A build resolves every artifact for the target, fetches and verifies all of
/// them, and only then installs; the overlay bundle, image preparation and the
/// build record follow. Any failure aborts the build.
pub struct Engine {
    manifest: BuildManifest,
    source: Box<dyn ArtifactSource>,
    runner: Box<dyn PackageRunner>,
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Defaults to the host architecture.
    pub target: Option<ArchTarget>,
    /// Build into this directory instead of the configured image root.
    pub root: Option<PathBuf>,
    pub skip_overlay: bool,
    pub skip_image: bool,
}

/// Outcome of a successful build.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub plan: BuildPlan,
    pub installed: Vec<InstalledArtifact>,
    pub overlay: Option<OverlayReport>,
    pub image: Option<ImagePreparation>,
    pub record: BuildRecord,
    pub record_path: PathBuf,
}

impl Engine {
    pub fn new(manifest: BuildManifest) -> Self {
        Self {
            manifest,
            source: Box::new(SourceRouter::default()),
            runner: Box::new(CommandRunner),
        }
    }

    pub fn from_manifest_file(path: &Path) -> Result<Self, CoreError> {
        info!("loading manifest {}", path.display());
        let manifest = parse_manifest_file(path)?.validate()?;
        Ok(Self::new(manifest))
    }

    #[must_use]
    pub fn with_source(mut self, source: Box<dyn ArtifactSource>) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn with_mirror(self, mirror: &Path) -> Self {
        self.with_source(Box::new(SourceRouter::new(Some(MirrorSource::new(mirror)))))
    }

    #[must_use]
    pub fn with_runner(mut self, runner: Box<dyn PackageRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn manifest(&self) -> &BuildManifest {
        &self.manifest
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.manifest.config
    }

    pub fn resolve(&self, target: ArchTarget) -> Result<BuildPlan, CoreError> {
        Ok(resolve_all(&self.manifest, target)?)
    }

    fn image_root(&self, options: &BuildOptions) -> PathBuf {
        options
            .root
            .clone()
            .unwrap_or_else(|| self.config().paths.image_root.clone())
    }

    fn check_interrupt(phase: &'static str) -> Result<(), CoreError> {
        if shutdown_requested() {
            return Err(CoreError::Interrupted(phase));
        }
        Ok(())
    }

    pub fn build(&self, options: &BuildOptions) -> Result<BuildResult, CoreError> {
        let root = self.image_root(options);
        let paths = &self.config().paths;
        let state_dir = ContainerConfig::in_root(&root, &paths.state_dir);
        let _lock = BuildLock::acquire_now(&state_dir.join(BuildLock::FILE_NAME))?;

        let target = match options.target {
            Some(target) => target,
            None => ArchTarget::host()?,
        };
        info!("building for {} into {}", target.platform(), root.display());

        let plan = self.resolve(target)?;
        debug!("resolved {} artifacts", plan.artifacts.len());
        Self::check_interrupt("fetching artifacts")?;

        let verified = plan
            .artifacts
            .iter()
            .map(|artifact| fetch_and_verify(artifact, self.source.as_ref()))
            .collect::<Result<Vec<VerifiedArtifact>, _>>()?;
        info!("verified {} artifacts", verified.len());
        Self::check_interrupt("installing artifacts")?;

        let installed = verified
            .iter()
            .map(|artifact| install(artifact, &root, self.runner.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        let overlay = match (&self.manifest.overlay, options.skip_overlay) {
            (Some(spec), false) => {
                Self::check_interrupt("fetching the overlay")?;
                let report = fetch_overlay(
                    spec,
                    target,
                    self.source.as_ref(),
                    &ContainerConfig::in_root(&root, &paths.download_dir),
                    &ContainerConfig::in_root(&root, &paths.overlay_root),
                )?;
                info!(
                    "overlay {} installed ({} entries)",
                    report.version, report.entries
                );
                Some(report)
            }
            _ => None,
        };

        let image = if options.skip_image {
            None
        } else {
            Some(prepare_image(self.config(), &root)?)
        };

        let record = BuildRecord::new(target, &installed, overlay.as_ref());
        let record_path = record.write(&state_dir)?;
        info!("build record written to {}", record_path.display());

        Ok(BuildResult {
            plan,
            installed,
            overlay,
            image,
            record,
            record_path,
        })
    }

    /// Check installed files against the build record under `root`.
    pub fn verify(&self, root: Option<&Path>) -> Result<BuildRecord, CoreError> {
        let root = root.map_or_else(|| self.config().paths.image_root.clone(), Path::to_path_buf);
        let state_dir = ContainerConfig::in_root(&root, &self.config().paths.state_dir);
        let record = BuildRecord::load(&state_dir)?;
        let verified = record.verify(&root)?;
        info!("{} installed artifacts match the build record", verified.len());
        Ok(record)
    }
}
