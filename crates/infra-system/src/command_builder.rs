//! Per-kind worker executables and their argument lists.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use vidforge_core::domain::{JobKind, JobPayload};

/// Program plus fixed leading arguments, e.g. `python3 workers/download.py`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutableSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ExecutableSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCommands {
    pub download: ExecutableSpec,
    pub parse: ExecutableSpec,
    pub generate: ExecutableSpec,
    /// Passed to download and generate workers as `--output-dir`
    pub output_dir: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
}

impl Default for WorkerCommands {
    fn default() -> Self {
        Self {
            download: ExecutableSpec::new("python3").arg("workers/download.py"),
            parse: ExecutableSpec::new("python3").arg("workers/parse.py"),
            generate: ExecutableSpec::new("python3").arg("workers/generate.py"),
            output_dir: None,
            working_dir: None,
        }
    }
}

impl WorkerCommands {
    pub fn for_kind(&self, kind: JobKind) -> &ExecutableSpec {
        match kind {
            JobKind::Download => &self.download,
            JobKind::Parse => &self.parse,
            JobKind::Generate => &self.generate,
        }
    }

    /// Full argument list (fixed leading args first) for one payload
    pub fn build_args(&self, payload: &JobPayload) -> Vec<String> {
        let mut args = self.for_kind(payload.kind()).args.clone();
        let mut push = |flag: &str, value: &str| {
            args.push(flag.to_string());
            args.push(value.to_string());
        };

        push("--video-id", payload.video_id());
        match payload {
            JobPayload::Download(p) => {
                if let Some(quality) = &p.quality {
                    push("--quality", quality);
                }
                if let Some(cookies) = &p.cookies_path {
                    push("--cookies", cookies);
                }
                if let Some(dir) = &self.output_dir {
                    push("--output-dir", &dir.to_string_lossy());
                }
            }
            JobPayload::Parse(p) => {
                if !p.languages.is_empty() {
                    push("--languages", &p.languages.join(","));
                }
                if let Some(cookies) = &p.cookies_path {
                    push("--cookies", cookies);
                }
            }
            JobPayload::Generate(p) => {
                push("--languages", &p.target_languages.join(","));
                if let Some(sheet_id) = &p.sheet_id {
                    push("--sheet-id", sheet_id);
                }
                if let Some(row) = &p.sheet_row {
                    push("--sheet-row", row);
                }
                if let Some(voice) = &p.voice {
                    push("--voice", voice);
                }
                if let Some(dir) = &self.output_dir {
                    push("--output-dir", &dir.to_string_lossy());
                }
            }
        }
        args
    }
}
