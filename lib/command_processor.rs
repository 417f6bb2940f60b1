//! `Processor` that shells out to the reconstruction model.
//!
//! Each item gets its own scratch directory holding `input/{id}.{ext}` and an empty `output/`.
//! The command's arguments may reference `{input}`, `{output}` and `{id}`; every regular file
//! the command leaves in `output/` becomes part of the artifact.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::pipeline::{Artifact, ArtifactFile, FetchedItem, ProcessError, Processor};
use crate::work::WorkId;

const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Splits a command line on whitespace. Quoting is not supported.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| "processor command must not be empty".to_string())?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    fn render_args(&self, input: &Path, output: &Path, id: &WorkId) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input)
                    .replace("{output}", &output)
                    .replace("{id}", id.as_str())
            })
            .collect()
    }
}

pub struct CommandProcessor {
    command: CommandSpec,
    work_root: PathBuf,
    timeout: Duration,
    keep_work_dirs: bool,
}

impl CommandProcessor {
    pub fn new(command: CommandSpec, work_root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command,
            work_root: work_root.into(),
            timeout,
            keep_work_dirs: false,
        }
    }

    /// Leaves scratch directories behind for debugging.
    pub fn keep_work_dirs(mut self, keep: bool) -> Self {
        self.keep_work_dirs = keep;
        self
    }

    async fn run(&self, work_id: &WorkId, input: &FetchedItem) -> Result<Artifact, ProcessError> {
        let work_dir = self.work_root.join(work_id.as_str());
        let input_dir = work_dir.join("input");
        let output_dir = work_dir.join("output");
        let fail = |message: String| ProcessError::new(work_id, message);

        if tokio::fs::try_exists(&work_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&work_dir)
                .await
                .map_err(|err| fail(format!("clearing {}: {err}", work_dir.display())))?;
        }
        for dir in [&input_dir, &output_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|err| fail(format!("creating {}: {err}", dir.display())))?;
        }
        let input_path = input_dir.join(format!(
            "{}.{}",
            work_id,
            extension_for(input.content_type.as_deref())
        ));
        tokio::fs::write(&input_path, &input.bytes)
            .await
            .map_err(|err| fail(format!("writing {}: {err}", input_path.display())))?;

        let args = self.command.render_args(&input_path, &output_dir, work_id);
        let started = Instant::now();
        let mut command = Command::new(&self.command.program);
        command
            .args(&args)
            .current_dir(&work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command
            .spawn()
            .map_err(|err| fail(format!("spawning `{}`: {err}", self.command.program)))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|err| fail(format!("waiting for processor: {err}")))?,
            Err(_) => {
                return Err(fail(format!(
                    "processor timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        };
        debug!(
            event = "processor_exited",
            work_id = %work_id,
            status = ?output.status.code(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "processor command finished"
        );
        if !output.status.success() {
            return Err(fail(format!(
                "processor exited with {}: {}",
                output.status,
                stderr_tail(&output.stderr)
            )));
        }

        let artifact = collect_outputs(&output_dir).await.map_err(fail)?;
        if artifact.files.is_empty() {
            return Err(fail("processor produced no output files".to_string()));
        }

        if !self.keep_work_dirs {
            if let Err(err) = tokio::fs::remove_dir_all(&work_dir).await {
                warn!(
                    event = "processor_cleanup_failed",
                    work_id = %work_id,
                    path = %work_dir.display(),
                    error = %err,
                    "could not remove processor scratch directory"
                );
            }
        }
        Ok(artifact)
    }
}

impl Processor for CommandProcessor {
    fn process<'a>(
        &'a self,
        work_id: &'a WorkId,
        input: &'a FetchedItem,
    ) -> BoxFuture<'a, Result<Artifact, ProcessError>> {
        Box::pin(self.run(work_id, input))
    }
}

fn extension_for(content_type: Option<&str>) -> &'static str {
    match content_type.map(|value| value.split(';').next().unwrap_or(value).trim()) {
        Some("image/png") => "png",
        Some("image/webp") => "webp",
        Some("image/heic") => "heic",
        _ => "jpg",
    }
}

async fn collect_outputs(dir: &Path) -> Result<Artifact, String> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|err| format!("reading {}: {err}", dir.display()))?;
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| format!("reading {}: {err}", dir.display()))?
    {
        let file_type = entry
            .file_type()
            .await
            .map_err(|err| format!("inspecting {}: {err}", entry.path().display()))?;
        if !file_type.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let contents = tokio::fs::read(entry.path())
            .await
            .map_err(|err| format!("reading {}: {err}", entry.path().display()))?;
        files.push(ArtifactFile { name, contents });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Artifact { files })
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::{CommandProcessor, CommandSpec};
    use crate::pipeline::{FetchedItem, Processor};
    use crate::work::WorkId;

    fn input() -> FetchedItem {
        FetchedItem {
            bytes: b"raw-image".to_vec(),
            content_type: Some("image/jpeg".to_string()),
        }
    }

    fn shell(script: &str) -> CommandSpec {
        CommandSpec {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                script.to_string(),
                "processor".to_string(),
                "{input}".to_string(),
                "{output}".to_string(),
                "{id}".to_string(),
            ],
        }
    }

    #[test]
    fn parses_whitespace_separated_commands() {
        let spec = CommandSpec::parse("  sharp predict -i {input}  -o {output} ").expect("spec");
        assert_eq!(spec.program, "sharp");
        assert_eq!(spec.args, vec!["predict", "-i", "{input}", "-o", "{output}"]);
        assert!(CommandSpec::parse("   ").is_err());
    }

    #[tokio::test]
    async fn collects_every_output_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let processor = CommandProcessor::new(
            shell(r#"cp "$1" "$2/$3.ply" && echo meta > "$2/$3.json""#),
            dir.path(),
            Duration::from_secs(10),
        );
        let id = WorkId::parse("abc").expect("id");

        let artifact = processor.process(&id, &input()).await.expect("process");
        let names: Vec<&str> = artifact.files.iter().map(|file| file.name.as_str()).collect();
        assert_eq!(names, vec!["abc.json", "abc.ply"]);
        assert_eq!(artifact.files[1].contents, b"raw-image".to_vec());
        assert!(!dir.path().join("abc").exists());
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr() {
        let dir = tempfile::tempdir().expect("tempdir");
        let processor = CommandProcessor::new(
            shell("echo 'model exploded' >&2; exit 3"),
            dir.path(),
            Duration::from_secs(10),
        );
        let id = WorkId::parse("abc").expect("id");

        let err = processor.process(&id, &input()).await.expect_err("failure");
        assert_eq!(err.work_id, id);
        assert!(err.message.contains("model exploded"), "{}", err.message);
    }

    #[tokio::test]
    async fn empty_output_is_a_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let processor = CommandProcessor::new(shell("true"), dir.path(), Duration::from_secs(10))
            .keep_work_dirs(true);
        let id = WorkId::parse("abc").expect("id");

        let err = processor.process(&id, &input()).await.expect_err("failure");
        assert!(err.message.contains("no output"));
        assert!(dir.path().join("abc/input/abc.jpg").exists());
    }

    #[tokio::test]
    async fn slow_commands_time_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let processor =
            CommandProcessor::new(shell("sleep 5"), dir.path(), Duration::from_millis(100));
        let id = WorkId::parse("abc").expect("id");

        let err = processor.process(&id, &input()).await.expect_err("timeout");
        assert!(err.message.contains("timed out"));
    }
}
