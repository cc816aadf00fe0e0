// src/documents.rs

use crate::config::ExtractionConfig;
use crate::error::{DecodeError, PipelineError};
use crate::heuristics::extract_notice;
use crate::llm_extract::Summarize;
use crate::pdf::{OpenDocument, PageLoader, PageSource};
use crate::upload::Upload;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Instrument, error, info, info_span, warn};

/// One row of map data, produced per notice directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractionRecord {
    pub filename: String,
    pub address: String,
    pub title: String,
    pub description: String,
    pub closing_date: String,
    pub file_link: String,
}

/// Attachments named like `Notice*.pdf` or `*Advertising*.pdf`.
pub fn is_notice_file(name: &str) -> bool {
    let name = name.to_lowercase();
    name.ends_with(".pdf") && (name.starts_with("notice") || name.contains("advertising"))
}

/// Regular files in `dir`, sorted by name.
fn sorted_files(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let directory_error = |source| PipelineError::Directory {
        path: dir.display().to_string(),
        source,
    };
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(directory_error)? {
        let entry = entry.map_err(directory_error)?;
        if entry.file_type().map_err(directory_error)?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Everything one run of the document driver needs.
pub struct Pipeline {
    pub cfg: ExtractionConfig,
    pub opener: Arc<dyn OpenDocument>,
    pub summarizer: Arc<dyn Summarize>,
    pub uploader: Arc<dyn Upload>,
}

impl Pipeline {
    async fn open(&self, path: &Path) -> Result<Arc<dyn PageSource>, DecodeError> {
        let opener = Arc::clone(&self.opener);
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || opener.open(&owned))
            .await
            .map_err(|e| DecodeError::Worker(e.to_string()))?
    }

    /// Extract the first notice PDF in `dir` and publish the directory.
    ///
    /// At most one record is returned; other attachments are ignored.
    pub async fn process_documents(&self, dir: &Path) -> Result<Vec<ExtractionRecord>, PipelineError> {
        let doc_id = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string());

        for path in sorted_files(dir)? {
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !is_notice_file(filename) {
                continue;
            }

            let source = self.open(&path).await.map_err(|source| PipelineError::Document {
                file: path.display().to_string(),
                source,
            })?;
            if source.page_count() == 0 {
                warn!(file = %filename, "Notice has no pages");
                continue;
            }

            let pages = PageLoader::new(source, self.cfg.page_timeout());
            if pages.looks_like_scanned() {
                warn!(file = %filename, "PDF looks scanned, text fields will likely be empty");
            }
            let fields = extract_notice(&pages, &doc_id, &self.cfg, self.summarizer.as_ref()).await;
            drop(pages);

            let file_link = match self.uploader.upload(dir, filename, &fields.address).await {
                Ok(link) => link,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Upload failed, record has no link");
                    String::new()
                }
            };

            let (filled, total) = fields.coverage();
            info!(
                file = %filename,
                title = %fields.title,
                description = %fields.description,
                filled,
                total,
                "Notice extracted"
            );

            return Ok(vec![ExtractionRecord {
                filename: filename.to_string(),
                address: fields.address,
                title: fields.title,
                description: fields.description,
                closing_date: fields.closing_date,
                file_link,
            }]);
        }

        Ok(Vec::new())
    }

    /// Run [`Self::process_documents`] over every subdirectory of `root`.
    ///
    /// Only a failure to list `root` itself aborts the run.
    pub async fn process_all_attachments(&self, root: &Path) -> Result<Vec<ExtractionRecord>, PipelineError> {
        let mut dirs = Vec::new();
        let entries = std::fs::read_dir(root).map_err(|source| PipelineError::Directory {
            path: root.display().to_string(),
            source,
        })?;
        for entry in entries.flatten() {
            if entry.file_type().is_ok_and(|t| t.is_dir()) {
                dirs.push(entry.path());
            }
        }
        dirs.sort();

        let mut records = Vec::new();
        for dir in &dirs {
            let span = info_span!("notice", dir = %dir.display());
            match self.process_documents(dir).instrument(span).await {
                Ok(found) => records.extend(found),
                Err(e) => error!(dir = %dir.display(), error = %e, "Skipping directory"),
            }
        }

        info!(root = %root.display(), directories = dirs.len(), notices = records.len(), "Got notices");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::JsonCache;
    use crate::error::BoxError;
    use crate::heuristics::tests::text_page;
    use crate::llm_extract::Summarizer;
    use crate::pdf::tests::FakePages;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::Mutex;

    /// Serves one fixed notice page for every file; names containing
    /// "broken" fail to decode.
    #[derive(Default)]
    struct FakeOpener {
        opened: Mutex<Vec<String>>,
    }

    impl OpenDocument for FakeOpener {
        fn open(&self, path: &Path) -> Result<Arc<dyn PageSource>, DecodeError> {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            self.opened.lock().unwrap().push(name.clone());
            if name.contains("broken") {
                return Err(DecodeError::Worker("not a PDF".to_string()));
            }
            if name.contains("empty") {
                return Ok(Arc::new(FakePages::new(Vec::new())));
            }
            let page = text_page(
                100.0,
                &[
                    "Description and Physical Address of Property",
                    "123 LONG street",
                    "Closing date",
                    "12 june 2025",
                ],
            );
            Ok(Arc::new(FakePages::new(vec![page])))
        }
    }

    struct LinkUploader {
        fail: bool,
    }

    #[async_trait]
    impl Upload for LinkUploader {
        async fn upload(&self, _dir: &Path, primary_file: &str, address: &str) -> Result<String, BoxError> {
            if self.fail {
                return Err("drive quota".into());
            }
            Ok(format!("https://tinyurl.com/{primary_file}/{}", address.len()))
        }
    }

    fn pipeline(opener: Arc<FakeOpener>, fail_upload: bool, cache_dir: &Path) -> Pipeline {
        Pipeline {
            cfg: ExtractionConfig::default(),
            opener,
            summarizer: Arc::new(Summarizer::new(None, JsonCache::new(cache_dir.join("summaries.json")))),
            uploader: Arc::new(LinkUploader { fail: fail_upload }),
        }
    }

    fn touch(dir: &Path, names: &[&str]) {
        fs::create_dir_all(dir).unwrap();
        for name in names {
            fs::write(dir.join(name), b"%PDF-1.4").unwrap();
        }
    }

    #[test]
    fn test_is_notice_file() {
        assert!(is_notice_file("notice1.pdf"));
        assert!(is_notice_file("NOTICE - Erf 12.PDF"));
        assert!(is_notice_file("Final Advertising Notice.pdf"));
        assert!(!is_notice_file("random.pdf"));
        assert!(!is_notice_file("notice.docx"));
    }

    #[tokio::test]
    async fn test_only_notice_file_is_processed() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("email-7");
        touch(&dir, &["notice1.pdf", "random.pdf"]);
        let opener = Arc::new(FakeOpener::default());

        let records = pipeline(opener.clone(), false, tmp.path())
            .process_documents(&dir)
            .await
            .unwrap();

        assert_eq!(*opener.opened.lock().unwrap(), vec!["notice1.pdf".to_string()]);
        assert_eq!(
            records,
            vec![ExtractionRecord {
                filename: "notice1.pdf".to_string(),
                address: "123 Long Street, Cape Town".to_string(),
                title: "123 Long Street".to_string(),
                description: String::new(),
                closing_date: "12 June 2025".to_string(),
                file_link: "https://tinyurl.com/notice1.pdf/26".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_stops_after_first_match() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("email-8");
        touch(&dir, &["advertising.pdf", "notice_a.pdf", "notice_b.pdf"]);
        let opener = Arc::new(FakeOpener::default());

        let records = pipeline(opener.clone(), false, tmp.path())
            .process_documents(&dir)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].filename, "advertising.pdf");
        assert_eq!(opener.opened.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_document_falls_through_to_next_notice() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("email-9");
        touch(&dir, &["notice_empty.pdf", "notice_real.pdf"]);
        let opener = Arc::new(FakeOpener::default());

        let records = pipeline(opener, false, tmp.path()).process_documents(&dir).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].filename, "notice_real.pdf");
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_record() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("email-10");
        touch(&dir, &["notice.pdf"]);

        let records = pipeline(Arc::new(FakeOpener::default()), true, tmp.path())
            .process_documents(&dir)
            .await
            .unwrap();
        assert_eq!(records[0].file_link, "");
        assert_eq!(records[0].title, "123 Long Street");
    }

    #[tokio::test]
    async fn test_decode_failure_does_not_halt_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("emails");
        touch(&root.join("a"), &["notice_broken.pdf"]);
        touch(&root.join("b"), &["random.pdf"]);
        touch(&root.join("c"), &["notice.pdf"]);
        fs::write(root.join("stray.txt"), b"not a directory").unwrap();

        let records = pipeline(Arc::new(FakeOpener::default()), false, tmp.path())
            .process_all_attachments(&root)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].filename, "notice.pdf");
    }

    #[tokio::test]
    async fn test_missing_root_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let result = pipeline(Arc::new(FakeOpener::default()), false, tmp.path())
            .process_all_attachments(&tmp.path().join("nope"))
            .await;
        assert!(matches!(result, Err(PipelineError::Directory { .. })));
    }
}
