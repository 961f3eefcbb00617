// Job payloads: one closed variant per job kind

use crate::domain::error::{DomainError, Result};
use crate::domain::job::JobKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPayload {
    pub video_id: String,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub cookies_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsePayload {
    pub video_id: String,
    /// Caption languages to fetch, worker default when empty
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub cookies_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratePayload {
    pub video_id: String,
    pub target_languages: Vec<String>,
    #[serde(default)]
    pub sheet_id: Option<String>,
    #[serde(default)]
    pub sheet_row: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
}

/// Immutable job input, tagged by `type` on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Download(DownloadPayload),
    Parse(ParsePayload),
    Generate(GeneratePayload),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Download(_) => JobKind::Download,
            JobPayload::Parse(_) => JobKind::Parse,
            JobPayload::Generate(_) => JobKind::Generate,
        }
    }

    pub fn video_id(&self) -> &str {
        match self {
            JobPayload::Download(p) => &p.video_id,
            JobPayload::Parse(p) => &p.video_id,
            JobPayload::Generate(p) => &p.video_id,
        }
    }

    /// `<sheet_id>:<row>` for generate jobs bound to a spreadsheet row
    pub fn correlation_token(&self) -> Option<String> {
        match self {
            JobPayload::Generate(GeneratePayload {
                sheet_id: Some(sheet),
                sheet_row: Some(row),
                ..
            }) => Some(format!("{}:{}", sheet, row)),
            _ => None,
        }
    }

    /// Values end up as worker arguments, so anything that could be read as
    /// a flag is rejected here.
    pub fn validate(&self) -> Result<()> {
        validate_token("video_id", self.video_id())?;
        match self {
            JobPayload::Download(p) => {
                if let Some(quality) = &p.quality {
                    validate_token("quality", quality)?;
                }
                validate_path("cookies_path", p.cookies_path.as_deref())?;
            }
            JobPayload::Parse(p) => {
                for lang in &p.languages {
                    validate_token("languages", lang)?;
                }
                validate_path("cookies_path", p.cookies_path.as_deref())?;
            }
            JobPayload::Generate(p) => {
                if p.target_languages.is_empty() {
                    return Err(DomainError::ValidationError(
                        "target_languages must not be empty".to_string(),
                    ));
                }
                for lang in &p.target_languages {
                    validate_token("target_languages", lang)?;
                }
                if p.sheet_row.is_some() && p.sheet_id.is_none() {
                    return Err(DomainError::ValidationError(
                        "sheet_row requires sheet_id".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn validate_token(field: &str, value: &str) -> Result<()> {
    let well_formed = !value.is_empty()
        && !value.starts_with('-')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if well_formed {
        Ok(())
    } else {
        Err(DomainError::ValidationError(format!(
            "{} has an invalid value: {:?}",
            field, value
        )))
    }
}

/// Paths may hold any characters, but never read as a flag
fn validate_path(field: &str, value: Option<&str>) -> Result<()> {
    match value {
        Some(path) if path.is_empty() || path.starts_with('-') => Err(
            DomainError::ValidationError(format!("{} has an invalid value: {:?}", field, path)),
        ),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate(sheet_id: Option<&str>, sheet_row: Option<&str>) -> JobPayload {
        JobPayload::Generate(GeneratePayload {
            video_id: "abc123".to_string(),
            target_languages: vec!["ko".to_string()],
            sheet_id: sheet_id.map(String::from),
            sheet_row: sheet_row.map(String::from),
            voice: None,
        })
    }

    #[test]
    fn test_payload_is_tagged_by_type() {
        let json = serde_json::json!({"type": "parse", "video_id": "abc123", "languages": ["en"]});
        let payload: JobPayload = serde_json::from_value(json).unwrap();
        assert_eq!(payload.kind(), JobKind::Parse);

        let back = serde_json::to_value(&payload).unwrap();
        assert_eq!(back["type"], "parse");
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let json = serde_json::json!({"type": "upload", "video_id": "abc123"});
        assert!(serde_json::from_value::<JobPayload>(json).is_err());
    }

    #[test]
    fn test_correlation_token_only_for_bound_generate() {
        assert_eq!(
            generate(Some("sheet1"), Some("42")).correlation_token().as_deref(),
            Some("sheet1:42")
        );
        assert!(generate(Some("sheet1"), None).correlation_token().is_none());

        let download = JobPayload::Download(DownloadPayload {
            video_id: "abc123".to_string(),
            quality: None,
            cookies_path: None,
        });
        assert!(download.correlation_token().is_none());
    }

    #[test]
    fn test_validate_rejects_flag_like_video_id() {
        let payload = JobPayload::Download(DownloadPayload {
            video_id: "--exec=rm".to_string(),
            quality: None,
            cookies_path: None,
        });
        assert!(payload.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_flag_like_cookies_path() {
        let download = |path: &str| {
            JobPayload::Download(DownloadPayload {
                video_id: "abc123".to_string(),
                quality: None,
                cookies_path: Some(path.to_string()),
            })
        };
        assert!(download("--exec=sh").validate().is_err());
        assert!(download("").validate().is_err());
        assert!(download("/home/me/cookies (1).txt").validate().is_ok());

        let parse = JobPayload::Parse(ParsePayload {
            video_id: "abc123".to_string(),
            languages: vec!["en".to_string()],
            cookies_path: Some("-o/tmp/x".to_string()),
        });
        assert!(parse.validate().is_err());
    }

    #[test]
    fn test_validate_generate_requires_languages() {
        let payload = JobPayload::Generate(GeneratePayload {
            video_id: "abc123".to_string(),
            target_languages: vec![],
            sheet_id: None,
            sheet_row: None,
            voice: None,
        });
        assert!(payload.validate().is_err());
        assert!(generate(Some("s"), Some("3")).validate().is_ok());
        assert!(generate(None, Some("3")).validate().is_err());
    }
}
