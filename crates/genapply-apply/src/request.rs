use crate::ValidationError;
use genapply_core::FileRecord;
use genapply_extract::FileBlockParser;
use serde::Deserialize;

/// Wire shape of an apply request before validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequestBody {
    #[serde(default)]
    pub files: Option<Vec<FileRecord>>,
    #[serde(default)]
    pub generated_code: Option<String>,
    #[serde(default)]
    pub packages: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplySource {
    Files,
    GeneratedCode,
}

/// A request whose shape has been checked and whose file list is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyRequest {
    pub source: ApplySource,
    pub files: Vec<FileRecord>,
    pub packages: Option<Vec<String>>,
}

impl ApplyRequest {
    pub fn from_files(files: Vec<FileRecord>) -> Self {
        Self {
            source: ApplySource::Files,
            files,
            packages: None,
        }
    }

    pub fn from_json(bytes: &[u8], parser: &FileBlockParser) -> Result<Self, ValidationError> {
        let body: ApplyRequestBody = serde_json::from_slice(bytes)
            .map_err(|err| ValidationError::MalformedBody(err.to_string()))?;
        Self::from_body(body, parser)
    }

    /// `files` takes precedence; `generatedCode` is only parsed when no file
    /// list was sent.
    pub fn from_body(body: ApplyRequestBody, parser: &FileBlockParser) -> Result<Self, ValidationError> {
        match (body.files, body.generated_code) {
            (Some(files), _) => Ok(Self {
                source: ApplySource::Files,
                files,
                packages: body.packages,
            }),
            (None, Some(code)) => {
                let files = parser.extract(&code).files;
                if files.is_empty() {
                    return Err(ValidationError::NoFileBlocks);
                }
                Ok(Self {
                    source: ApplySource::GeneratedCode,
                    files,
                    packages: body.packages,
                })
            }
            (None, None) => Err(ValidationError::MissingInput),
        }
    }

    /// Accepts either a JSON request body or raw generated text.
    pub fn from_text(text: &str, parser: &FileBlockParser) -> Result<Self, ValidationError> {
        if text.trim_start().starts_with('{') {
            return Self::from_json(text.as_bytes(), parser);
        }
        Self::from_body(
            ApplyRequestBody {
                generated_code: Some(text.to_string()),
                ..ApplyRequestBody::default()
            },
            parser,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_body_is_taken_verbatim() {
        let request = ApplyRequest::from_json(
            br#"{"files":[{"path":"src/a.txt","content":"hi"}],"packages":["zod"]}"#,
            &FileBlockParser::new(),
        )
        .expect("valid");
        assert_eq!(request.source, ApplySource::Files);
        assert_eq!(request.files, vec![FileRecord::new("src/a.txt", "hi")]);
        assert_eq!(request.packages, Some(vec!["zod".to_string()]));
    }

    #[test]
    fn generated_code_is_extracted() {
        let request = ApplyRequest::from_json(
            br#"{"generatedCode":"Intro <file path=\"src/x.ts\">x</file>"}"#,
            &FileBlockParser::new(),
        )
        .expect("valid");
        assert_eq!(request.source, ApplySource::GeneratedCode);
        assert_eq!(request.files, vec![FileRecord::new("src/x.ts", "x")]);
        assert_eq!(request.packages, None);
    }

    #[test]
    fn malformed_and_empty_bodies_are_validation_errors() {
        let parser = FileBlockParser::new();
        assert!(matches!(
            ApplyRequest::from_json(b"{not json", &parser),
            Err(ValidationError::MalformedBody(_))
        ));
        assert!(matches!(
            ApplyRequest::from_json(b"{}", &parser),
            Err(ValidationError::MissingInput)
        ));
        assert!(matches!(
            ApplyRequest::from_json(br#"{"generatedCode":"just prose"}"#, &parser),
            Err(ValidationError::NoFileBlocks)
        ));
        assert!(matches!(
            ApplyRequest::from_json(br#"{"files":[{"path":"a"}]}"#, &parser),
            Err(ValidationError::MalformedBody(_))
        ));
    }

    #[test]
    fn raw_text_is_treated_as_generated_code() {
        let parser = FileBlockParser::new();
        let request =
            ApplyRequest::from_text("<file path=\"src/a.css\">a{}</file>", &parser).expect("valid");
        assert_eq!(request.files[0].path, "src/a.css");
        let json = ApplyRequest::from_text(r#" {"files":[]}"#, &parser).expect("valid");
        assert!(json.files.is_empty());
    }
}
