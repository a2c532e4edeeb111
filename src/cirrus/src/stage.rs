use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use url::Url;

use crate::storage_local::ensure_dir;
use crate::storage_s3::{http_download, is_http_url, is_s3_url, split_s3_url, S3Client};
use crate::utils::basename_from_url;

/// How the value of a recognized option is treated during localization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// A whole key prefix downloaded into the persistent data root and
    /// reused across jobs.
    ReferenceDir,
    /// Never downloaded; rewritten to the job working directory so the
    /// engine writes locally.
    OutputDir,
    /// A single remote object downloaded into the job inputs directory.
    InputFile,
}

#[derive(Debug)]
pub struct ArgSpec {
    pub field: &'static str,
    pub aliases: &'static [&'static str],
    pub kind: ArgKind,
}

/// The engine options whose values may carry remote locations. Scanned in
/// table order; within an entry, the first alias present in the argument
/// vector wins.
pub static RECOGNIZED_ARGS: &[ArgSpec] = &[
    ArgSpec { field: "ref-dir", aliases: &["-r", "--ref-dir"], kind: ArgKind::ReferenceDir },
    ArgSpec { field: "output-directory", aliases: &["--output-directory"], kind: ArgKind::OutputDir },
    ArgSpec { field: "fastq-list", aliases: &["--fastq-list"], kind: ArgKind::InputFile },
    ArgSpec { field: "tumor-fastq-list", aliases: &["--tumor-fastq-list"], kind: ArgKind::InputFile },
    ArgSpec { field: "vc-target-bed", aliases: &["--vc-target-bed"], kind: ArgKind::InputFile },
    ArgSpec { field: "vc-depth-intervals-bed", aliases: &["--vc-depth-intervals-bed"], kind: ArgKind::InputFile },
    ArgSpec { field: "cnv-normals-list", aliases: &["--cnv-normals-list"], kind: ArgKind::InputFile },
    ArgSpec { field: "cnv-target-bed", aliases: &["--cnv-target-bed"], kind: ArgKind::InputFile },
    ArgSpec { field: "dbsnp", aliases: &["--dbsnp"], kind: ArgKind::InputFile },
    ArgSpec { field: "cosmic", aliases: &["--cosmic"], kind: ArgKind::InputFile },
    ArgSpec { field: "qc-cross-cont-vcf", aliases: &["--qc-cross-cont-vcf"], kind: ArgKind::InputFile },
    ArgSpec { field: "qc-coverage-region-1", aliases: &["--qc-coverage-region-1"], kind: ArgKind::InputFile },
    ArgSpec { field: "qc-coverage-region-2", aliases: &["--qc-coverage-region-2"], kind: ArgKind::InputFile },
    ArgSpec { field: "qc-coverage-region-3", aliases: &["--qc-coverage-region-3"], kind: ArgKind::InputFile },
];

/// A recognized option discovered in the argument vector: the option's value
/// token and the index it sits at, so it can be rewritten in place.
#[derive(Debug, Clone)]
pub struct FoundArg {
    pub spec: &'static ArgSpec,
    pub index: usize,
    pub value: String,
}

/// The engine argument vector plus the recognized options discovered in it.
/// Values are rewritten in place as their referenced objects are localized.
#[derive(Debug)]
pub struct JobArgs {
    args: Vec<String>,
    found: Vec<FoundArg>,
}

impl JobArgs {
    /// Scan a raw argument vector for the recognized options.
    ///
    /// # Errors
    ///
    /// An option present as the final token has no value to read; that is a
    /// malformed invocation and is refused here, before any side effects.
    pub fn parse(args: Vec<String>) -> Result<Self> {
        let mut found = Vec::new();

        for spec in RECOGNIZED_ARGS {
            let position = spec
                .aliases
                .iter()
                .find_map(|alias| args.iter().position(|a| a == alias));

            if let Some(pos) = position {
                if pos + 1 >= args.len() {
                    bail!("Option '{}' is missing its value", args[pos]);
                }
                found.push(FoundArg {
                    spec,
                    index: pos + 1,
                    value: args[pos + 1].clone(),
                });
            }
        }

        Ok(JobArgs { args, found })
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn found(&self) -> &[FoundArg] {
        &self.found
    }

    #[must_use]
    pub fn first_of_kind(&self, kind: ArgKind) -> Option<&FoundArg> {
        self.found.iter().find(|f| f.spec.kind == kind)
    }

    /// The remote output location as given on the command line, if any. This
    /// is captured at parse time because the argument itself is later
    /// rewritten to the local working directory.
    #[must_use]
    pub fn output_url(&self) -> Option<&str> {
        self.first_of_kind(ArgKind::OutputDir).map(|f| f.value.as_str())
    }

    /// True when any recognized value points at the object store, in which
    /// case a client must be constructed before localization or upload.
    #[must_use]
    pub fn needs_object_store(&self) -> bool {
        self.found.iter().any(|f| is_s3_url(&f.value))
    }

    /// Overwrite the argument at `index` with a new value, keeping the
    /// discovery record in sync.
    pub fn rewrite(&mut self, index: usize, value: &str) {
        self.args[index] = value.to_string();
        if let Some(found) = self.found.iter_mut().find(|f| f.index == index) {
            found.value = value.to_string();
        }
    }

    /// Append extra tokens to the end of the vector (operational flags the
    /// wrapper injects for its own bookkeeping).
    pub fn push_args<I: IntoIterator<Item = String>>(&mut self, extra: I) {
        self.args.extend(extra);
    }

    /// Materialize every recognized remote value locally and rewrite the
    /// argument vector in place:
    ///
    /// * the reference directory is fetched as a whole prefix into
    ///   `data_root` (and deliberately left there for reuse by later jobs);
    /// * each input file is fetched into `<data_root>/inputs/`;
    /// * the output directory is left alone (the job runner substitutes it
    ///   with the working directory it provisions).
    ///
    /// A failed transfer aborts localization immediately; values that are
    /// already local paths are left untouched.
    pub fn localize(&mut self, store: Option<&S3Client>, data_root: &Path) -> Result<()> {
        let inputs_dir = data_root.join("inputs");

        let pending: Vec<FoundArg> = self.found.clone();
        for found in pending {
            match found.spec.kind {
                ArgKind::OutputDir => {}
                ArgKind::ReferenceDir => {
                    let local = self.localize_reference(store, &found, data_root)?;
                    if let Some(local) = local {
                        self.rewrite(found.index, &local.to_string_lossy());
                    }
                }
                ArgKind::InputFile => {
                    let local = self.localize_input(store, &found, &inputs_dir)?;
                    if let Some(local) = local {
                        self.rewrite(found.index, &local.to_string_lossy());
                    }
                }
            }
        }

        Ok(())
    }

    fn localize_reference(
        &self,
        store: Option<&S3Client>,
        found: &FoundArg,
        data_root: &Path,
    ) -> Result<Option<PathBuf>> {
        if !is_s3_url(&found.value) {
            if is_http_url(&found.value) {
                bail!(
                    "Reference directory '{}' must be an s3:// URL or a local path",
                    found.value
                );
            }
            // Already a local directory.
            return Ok(None);
        }

        let (bucket, key) = split_s3_url(&found.value)?;
        if key.is_empty() {
            bail!("Reference URL '{}' has no key prefix", found.value);
        }

        let store = store_required(store, &found.value)?;

        crate::elog!("Downloading reference tables from {}", found.value);
        let bytes = store.download_prefix(&bucket, &key, data_root)?;
        crate::elog!("Reference download complete ({} bytes)", bytes);

        Ok(Some(data_root.join(key.trim_end_matches('/'))))
    }

    fn localize_input(
        &self,
        store: Option<&S3Client>,
        found: &FoundArg,
        inputs_dir: &Path,
    ) -> Result<Option<PathBuf>> {
        let target = if is_s3_url(&found.value) {
            let (bucket, key) = split_s3_url(&found.value)?;
            if key.is_empty() || key.ends_with('/') {
                bail!("Input URL '{}' does not name an object", found.value);
            }

            let url = Url::parse(&found.value)
                .with_context(|| format!("Could not parse URL '{}'", found.value))?;
            let target = inputs_dir.join(basename_from_url(&url)?);

            let store = store_required(store, &found.value)?;
            crate::elog!("Downloading {} input from {}", found.spec.field, found.value);
            store.download_object(&bucket, &key, &target)?;
            target
        } else if is_http_url(&found.value) {
            let url = Url::parse(&found.value)
                .with_context(|| format!("Could not parse URL '{}'", found.value))?;
            crate::elog!("Downloading {} input from {}", found.spec.field, url);
            http_download(&url, inputs_dir)?
        } else {
            // A plain local path; nothing to do.
            return Ok(None);
        };

        if !target.is_file() {
            bail!(
                "Localized input for '{}' is missing at {}",
                found.spec.field,
                target.display()
            );
        }

        Ok(Some(target))
    }
}

fn store_required<'a>(store: Option<&'a S3Client>, value: &str) -> Result<&'a S3Client> {
    store.ok_or_else(|| {
        anyhow::anyhow!("Argument '{}' needs object storage, but no client is configured", value)
    })
}

/// Make sure the job inputs directory exists before any download starts.
pub fn prepare_inputs_dir(data_root: &Path) -> Result<PathBuf> {
    let inputs_dir = data_root.join("inputs");
    ensure_dir(&inputs_dir)?;
    Ok(inputs_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn to_args(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_parse_finds_recognized_options() {
        let args = JobArgs::parse(to_args(&[
            "-f",
            "--ref-dir",
            "s3://refs/hg38",
            "--fastq-list",
            "s3://runs/batch1/fastq_list.csv",
            "--output-directory",
            "s3://results/sample42",
        ]))
        .unwrap();

        let reference = args.first_of_kind(ArgKind::ReferenceDir).unwrap();
        assert_eq!(reference.index, 2);
        assert_eq!(reference.value, "s3://refs/hg38");

        let fastq = args
            .found()
            .iter()
            .find(|f| f.spec.field == "fastq-list")
            .unwrap();
        assert_eq!(fastq.index, 4);

        assert_eq!(args.output_url(), Some("s3://results/sample42"));
        assert!(args.needs_object_store());
    }

    #[test]
    fn test_parse_first_alias_wins() {
        // '-r' is listed before '--ref-dir', so it wins even though the long
        // form appears earlier in the vector.
        let args = JobArgs::parse(to_args(&[
            "--ref-dir",
            "s3://refs/a",
            "-r",
            "s3://refs/b",
        ]))
        .unwrap();

        let reference = args.first_of_kind(ArgKind::ReferenceDir).unwrap();
        assert_eq!(reference.value, "s3://refs/b");
    }

    #[test]
    fn test_parse_rejects_trailing_option() {
        let err = JobArgs::parse(to_args(&["--enable-map", "true", "--dbsnp"])).unwrap_err();
        assert!(err.to_string().contains("--dbsnp"));
    }

    #[test]
    fn test_rewrite_in_place() {
        let mut args = JobArgs::parse(to_args(&["--vc-target-bed", "s3://in/t.bed"])).unwrap();
        args.rewrite(1, "/ephemeral/inputs/t.bed");

        assert_eq!(args.args()[1], "/ephemeral/inputs/t.bed");
        assert_eq!(args.found()[0].value, "/ephemeral/inputs/t.bed");
    }

    #[test]
    fn test_localize_leaves_local_values_untouched() {
        let mut args = JobArgs::parse(to_args(&[
            "-r",
            "/ephemeral/refs/hg38",
            "--vc-target-bed",
            "/data/targets.bed",
            "--output-directory",
            "/tmp/out",
        ]))
        .unwrap();

        assert!(!args.needs_object_store());
        args.localize(None, Path::new("/ephemeral")).unwrap();

        assert_eq!(args.args()[1], "/ephemeral/refs/hg38");
        assert_eq!(args.args()[3], "/data/targets.bed");
    }

    #[test]
    fn test_localize_without_store_is_an_error_for_s3() {
        let mut args = JobArgs::parse(to_args(&["--dbsnp", "s3://in/dbsnp.vcf"])).unwrap();
        let err = args.localize(None, Path::new("/ephemeral")).unwrap_err();
        assert!(err.to_string().contains("no client is configured"));
    }

    #[test]
    fn test_localize_rejects_http_reference() {
        let mut args =
            JobArgs::parse(to_args(&["--ref-dir", "https://example.com/refs"])).unwrap();
        assert!(args.localize(None, Path::new("/ephemeral")).is_err());
    }

    #[test]
    fn test_push_args() {
        let mut args = JobArgs::parse(to_args(&["--enable-map", "true"])).unwrap();
        args.push_args(["--lic-no-print".to_string()]);
        assert_eq!(args.args().last().unwrap(), "--lic-no-print");
    }
}
