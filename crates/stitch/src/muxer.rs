// Muxer: turns the local manifest into the final output container.

use std::collections::VecDeque;
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::config::MuxerConfig;
use crate::error::StitchError;

/// Stderr lines kept for the error message of a failed mux.
const STDERR_TAIL_LINES: usize = 20;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Concatenates the files referenced by a local manifest into `output`.
#[async_trait]
pub trait Muxer: Send + Sync {
    async fn mux(&self, manifest: &Path, output: &Path) -> Result<(), StitchError>;
}

/// [`Muxer`] that stream-copies through an `ffmpeg` binary.
#[derive(Debug, Clone, Default)]
pub struct FfmpegMuxer {
    config: MuxerConfig,
}

impl FfmpegMuxer {
    pub fn new(config: MuxerConfig) -> Self {
        Self { config }
    }

    pub fn args(&self, manifest: &Path, output: &Path) -> Vec<std::ffi::OsString> {
        let mut args: Vec<std::ffi::OsString> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            if self.config.overwrite { "-y" } else { "-n" }.into(),
            "-allowed_extensions".into(),
            "ALL".into(),
            "-protocol_whitelist".into(),
            "file".into(),
            "-i".into(),
            manifest.as_os_str().to_owned(),
            "-c".into(),
            "copy".into(),
        ];
        args.extend(self.config.extra_args.iter().map(Into::into));
        args.push(output.as_os_str().to_owned());
        args
    }
}

#[async_trait]
impl Muxer for FfmpegMuxer {
    async fn mux(&self, manifest: &Path, output: &Path) -> Result<(), StitchError> {
        let start = std::time::Instant::now();
        let mut command = tokio_command(&self.config.ffmpeg_path);
        command
            .args(self.args(manifest, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(ffmpeg = %self.config.ffmpeg_path.display(), output = %output.display(), "Spawning muxer");
        let mut child = command.spawn().map_err(|e| {
            StitchError::muxer(format!(
                "failed to spawn `{}`: {e}",
                self.config.ffmpeg_path.display()
            ))
        })?;

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.to_lowercase().contains("error") {
                        warn!("ffmpeg: {}", line);
                    } else {
                        debug!("ffmpeg: {}", line);
                    }
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail
            })
        });

        let status = child.wait().await?;
        let tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => VecDeque::new(),
        };

        if !status.success() {
            let tail: Vec<String> = tail.into();
            return Err(StitchError::muxer(format!(
                "ffmpeg exited with {status}: {}",
                tail.join("\n")
            )));
        }

        info!(
            output = %output.display(),
            duration_secs = start.elapsed().as_secs_f64(),
            "Muxed output"
        );
        Ok(())
    }
}

/// `tokio::process::Command` that does not open a console window on Windows.
fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    #[allow(unused_mut)]
    let mut command = tokio::process::Command::new(program);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        command.as_std_mut().creation_flags(CREATE_NO_WINDOW);
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn builds_stream_copy_arguments() {
        let muxer = FfmpegMuxer::new(MuxerConfig {
            extra_args: vec!["-movflags".into(), "+faststart".into()],
            ..MuxerConfig::default()
        });
        let args = muxer.args(Path::new("/work/local.m3u8"), Path::new("/out/video.mp4"));
        let args: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let whitelist = args.iter().position(|a| a == "-protocol_whitelist").unwrap();
        assert_eq!(args[whitelist + 1], "file");
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], "/work/local.m3u8");
        assert!(args.windows(2).any(|w| w == ["-c", "copy"]));
        assert!(args.contains(&"-y".to_owned()));
        assert_eq!(args[args.len() - 3..], ["-movflags", "+faststart", "/out/video.mp4"]);
    }

    #[test]
    fn no_overwrite_uses_n_flag() {
        let muxer = FfmpegMuxer::new(MuxerConfig {
            overwrite: false,
            ..MuxerConfig::default()
        });
        let args = muxer.args(Path::new("a.m3u8"), Path::new("b.ts"));
        assert!(args.iter().any(|a| a == "-n"));
        assert!(!args.iter().any(|a| a == "-y"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_muxer_error() {
        let muxer = FfmpegMuxer::new(MuxerConfig {
            ffmpeg_path: PathBuf::from("/nonexistent/ffmpeg-binary"),
            ..MuxerConfig::default()
        });
        let err = muxer
            .mux(Path::new("/tmp/local.m3u8"), Path::new("/tmp/out.ts"))
            .await
            .unwrap_err();
        assert!(matches!(err, StitchError::Muxer { .. }));
    }
}
