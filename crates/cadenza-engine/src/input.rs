//! Input resolution: turning a step's normalized input entries into an
//! in-memory bundle of typed items.
//!
//! Every resolver owns a scoped temp directory; files materialized for
//! STDIN, database results, URL fetches, screenshots, and normalized images
//! live there and are removed when the step's execution scope ends,
//! success or failure.

use crate::deps::DependencyReport;
use crate::error::{EngineError, Result};
use crate::executor::RunOptions;
use crate::plan::{self, SpecEntry, NA, SCREENSHOT, STDIN};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use cadenza_core::database::{self, Database, SqliteDatabase, SqlKind};
use cadenza_core::environment::Environment;
use cadenza_core::files::{self, FileClass};
use cadenza_core::scrape::{self, HttpScraper, ScrapedPage, Scraper};
use cadenza_core::screenshot::{FileBackedCapturer, ScreenCapturer};
use image::DynamicImage;
use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Screenshot items are clipped to this region of the primary display.
const SCREENSHOT_WIDTH: u32 = 1024;
const SCREENSHOT_HEIGHT: u32 = 768;

const URL_OVERALL_TIMEOUT: Duration = Duration::from_secs(10);
const URL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub type ScraperFactory = Box<dyn Fn() -> Box<dyn Scraper> + Send + Sync>;

/// The collaborators a resolver may call while materializing inputs.
pub struct Collaborators {
    pub scraper: ScraperFactory,
    pub database: Box<dyn Database>,
    pub capturer: Box<dyn ScreenCapturer>,
}

impl Collaborators {
    pub fn standard(env: &Environment) -> Self {
        Collaborators {
            scraper: Box::new(|| Box::new(HttpScraper::new()) as Box<dyn Scraper>),
            database: Box::new(SqliteDatabase::new(env.clone())),
            capturer: Box::new(FileBackedCapturer::new()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum InputKind {
    Text {
        path: PathBuf,
        mime: String,
        bytes: Vec<u8>,
    },
    Image {
        path: PathBuf,
        png_base64: String,
    },
    Screenshot {
        path: PathBuf,
        png_base64: String,
    },
    Document {
        path: PathBuf,
        mime: String,
        bytes: Vec<u8>,
    },
    Scraped(ScrapedPage),
}

/// One resolved input, carrying its type tag and a metadata map.
#[derive(Debug, Clone)]
pub struct InputItem {
    pub kind: InputKind,
    pub metadata: HashMap<String, String>,
}

impl InputItem {
    fn new(kind: InputKind, metadata: HashMap<String, String>) -> Self {
        InputItem { kind, metadata }
    }

    /// File items carry a path a provider can attach.
    pub fn is_file(&self) -> bool {
        !matches!(self.kind, InputKind::Scraped(_))
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.kind {
            InputKind::Text { path, .. }
            | InputKind::Image { path, .. }
            | InputKind::Screenshot { path, .. }
            | InputKind::Document { path, .. } => Some(path),
            InputKind::Scraped(_) => None,
        }
    }

    pub fn mime(&self) -> Option<&str> {
        match &self.kind {
            InputKind::Text { mime, .. } | InputKind::Document { mime, .. } => Some(mime),
            InputKind::Image { .. } | InputKind::Screenshot { .. } => Some("image/png"),
            InputKind::Scraped(_) => None,
        }
    }

    /// The display name for per-file headers: the original path when the
    /// item was materialized into the temp directory.
    pub fn display_path(&self) -> String {
        if let Some(original) = self.metadata.get("original_path") {
            return original.clone();
        }
        self.path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(inline)".to_string())
    }

    /// Textual content, for prompt assembly. Binary items yield nothing.
    pub fn text_content(&self) -> Option<String> {
        match &self.kind {
            InputKind::Text { bytes, .. } => {
                Some(String::from_utf8_lossy(bytes).to_string())
            }
            InputKind::Scraped(page) => Some(render_scraped_page(page)),
            _ => None,
        }
    }
}

fn render_scraped_page(page: &ScrapedPage) -> String {
    let mut out = format!("Title: {}\nURL: {}\n\n", page.title, page.url);
    out.push_str(&page.paragraphs.join("\n\n"));
    if !page.links.is_empty() {
        out.push_str("\n\nLinks:\n");
        for link in &page.links {
            out.push_str(&format!("- {}\n", link));
        }
    }
    out
}

/// Capability a model must advertise for a class of inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Text,
    Vision,
    File,
}

pub fn required_capabilities(items: &[InputItem]) -> Vec<Capability> {
    let mut capabilities = Vec::new();
    for item in items {
        let capability = match &item.kind {
            InputKind::Text { .. } | InputKind::Scraped(_) => Capability::Text,
            InputKind::Image { .. } | InputKind::Screenshot { .. } => Capability::Vision,
            InputKind::Document { .. } => Capability::File,
        };
        if !capabilities.contains(&capability) {
            capabilities.push(capability);
        }
    }
    capabilities
}

/// Per-step input resolver. Dropping it removes the temp directory.
pub struct InputResolver<'a> {
    step: &'a str,
    report: &'a DependencyReport,
    collaborators: &'a Collaborators,
    base_dir: Option<PathBuf>,
    temp: TempDir,
    counter: usize,
}

impl<'a> InputResolver<'a> {
    pub fn new(
        step: &'a str,
        report: &'a DependencyReport,
        collaborators: &'a Collaborators,
        options: &RunOptions,
    ) -> Result<Self> {
        let temp = TempDir::new()
            .map_err(|e| input_error(step, format!("cannot create temp directory: {}", e)))?;
        Ok(InputResolver {
            step,
            report,
            collaborators,
            base_dir: options.output_base(),
            temp,
            counter: 0,
        })
    }

    pub fn resolve(
        &mut self,
        entries: &[SpecEntry],
        last_output: Option<&str>,
        vars: &mut HashMap<String, String>,
    ) -> Result<Vec<InputItem>> {
        let mut items = Vec::new();
        for entry in entries {
            match entry {
                SpecEntry::Value(raw) => {
                    self.resolve_value(raw, last_output, vars, &mut items)?
                }
                SpecEntry::Record(map) => self.resolve_record(map, &mut items)?,
            }
        }
        Ok(items)
    }

    fn resolve_value(
        &mut self,
        raw: &str,
        last_output: Option<&str>,
        vars: &mut HashMap<String, String>,
        items: &mut Vec<InputItem>,
    ) -> Result<()> {
        let (base, var) = plan::split_var_binding(raw);
        if base == NA || base.is_empty() {
            return Ok(());
        }

        if base == STDIN {
            let previous = last_output.unwrap_or("");
            if let Some(name) = var {
                vars.insert(name.to_string(), previous.to_string());
            }
            let path = self.temp_path("stdin", "txt");
            fs::write(&path, previous)
                .map_err(|e| input_error(self.step, format!("cannot write temp file: {}", e)))?;
            return self.process_path(&path, metadata_for("stdin"), items);
        }

        if base == SCREENSHOT {
            return self.capture_screenshot(items);
        }

        if base.starts_with("http://") || base.starts_with("https://") {
            return self.fetch_url(base, items);
        }

        if base.chars().any(|c| matches!(c, '*' | '?' | '[' | ']')) {
            let pattern = glob::glob(base).map_err(|e| {
                input_error(self.step, format!("invalid glob pattern '{}': {}", base, e))
            })?;
            let matches: Vec<PathBuf> = pattern.filter_map(|m| m.ok()).collect();
            if matches.is_empty() {
                return Err(input_error(
                    self.step,
                    format!("no files found matching pattern '{}'", base),
                ));
            }
            for path in matches {
                self.process_path(&path, HashMap::new(), items)?;
            }
            return Ok(());
        }

        let path = Path::new(base);
        if path.exists() {
            return self.process_path(path, HashMap::new(), items);
        }
        if let Some(base_dir) = &self.base_dir {
            let under_base = base_dir.join(path);
            if under_base.exists() {
                return self.process_path(&under_base, HashMap::new(), items);
            }
        }
        if self.report.is_declared_output(base) {
            // Declared later in the plan and not yet written; nothing to read.
            return Ok(());
        }
        Err(input_error(
            self.step,
            format!(
                "input path '{}' does not exist and is not a declared output",
                base
            ),
        ))
    }

    fn resolve_record(
        &mut self,
        map: &std::collections::BTreeMap<String, serde_yaml::Value>,
        items: &mut Vec<InputItem>,
    ) -> Result<()> {
        if map.contains_key("url") {
            return self.scrape_record(map, items);
        }
        if map.contains_key("database") {
            return self.database_record(map, items);
        }
        Err(input_error(
            self.step,
            format!(
                "unknown input record with keys [{}]",
                map.keys().cloned().collect::<Vec<_>>().join(", ")
            ),
        ))
    }

    fn scrape_record(
        &mut self,
        map: &std::collections::BTreeMap<String, serde_yaml::Value>,
        items: &mut Vec<InputItem>,
    ) -> Result<()> {
        let url = map
            .get("url")
            .and_then(plan::yaml_scalar_to_string)
            .ok_or_else(|| input_error(self.step, "url record has no url string".to_string()))?;

        let mut scraper = (self.collaborators.scraper)();
        if let Some(domains) = map.get("allowed_domains").and_then(|v| v.as_sequence()) {
            scraper.set_allowed_domains(
                domains
                    .iter()
                    .filter_map(|d| d.as_str().map(|s| s.to_string()))
                    .collect(),
            );
        }
        if let Some(headers) = map.get("headers").and_then(|v| v.as_mapping()) {
            scraper.set_custom_headers(
                headers
                    .iter()
                    .filter_map(|(k, v)| Some((k.as_str()?.to_string(), v.as_str()?.to_string())))
                    .collect(),
            );
        }

        let page = scraper
            .scrape(&url)
            .map_err(|e| input_error(self.step, format!("scrape of '{}' failed: {}", url, e)))?;

        let mut metadata = metadata_for("scrape");
        metadata.insert("url".to_string(), url);
        items.push(InputItem::new(InputKind::Scraped(page), metadata));
        Ok(())
    }

    fn database_record(
        &mut self,
        map: &std::collections::BTreeMap<String, serde_yaml::Value>,
        items: &mut Vec<InputItem>,
    ) -> Result<()> {
        let db = map
            .get("database")
            .and_then(plan::yaml_scalar_to_string)
            .ok_or_else(|| {
                input_error(self.step, "database record has no database name".to_string())
            })?;
        let sql = map
            .get("sql")
            .and_then(plan::yaml_scalar_to_string)
            .ok_or_else(|| input_error(self.step, "database record has no sql".to_string()))?;

        let text = match database::kind_of(&sql) {
            SqlKind::Read => {
                let rows = self
                    .collaborators
                    .database
                    .execute_read(&db, &sql)
                    .map_err(|e| input_error(self.step, format!("database read failed: {}", e)))?;
                serde_json::to_string_pretty(&rows)
                    .map_err(|e| EngineError::Internal(e.to_string()))?
            }
            SqlKind::Write => {
                let affected = self
                    .collaborators
                    .database
                    .execute_write(&db, &sql)
                    .map_err(|e| input_error(self.step, format!("database write failed: {}", e)))?;
                format!("affected rows: {}", affected)
            }
        };

        let path = self.temp_path("db", "txt");
        fs::write(&path, &text)
            .map_err(|e| input_error(self.step, format!("cannot write temp file: {}", e)))?;
        let mut metadata = metadata_for("database");
        metadata.insert("database".to_string(), db);
        self.process_path(&path, metadata, items)
    }

    fn capture_screenshot(&mut self, items: &mut Vec<InputItem>) -> Result<()> {
        let frame = self
            .collaborators
            .capturer
            .capture_primary()
            .map_err(|e| input_error(self.step, format!("screenshot capture failed: {}", e)))?;

        let (width, height) = frame.dimensions();
        let clipped = image::imageops::crop_imm(
            &frame,
            0,
            0,
            width.min(SCREENSHOT_WIDTH),
            height.min(SCREENSHOT_HEIGHT),
        )
        .to_image();

        let mut png = Vec::new();
        DynamicImage::ImageRgba8(clipped)
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .map_err(|e| input_error(self.step, format!("cannot encode screenshot: {}", e)))?;

        let path = self.temp_path("screenshot", "png");
        fs::write(&path, &png)
            .map_err(|e| input_error(self.step, format!("cannot write temp file: {}", e)))?;

        items.push(InputItem::new(
            InputKind::Screenshot {
                path,
                png_base64: STANDARD.encode(&png),
            },
            metadata_for("screenshot"),
        ));
        Ok(())
    }

    fn fetch_url(&mut self, url: &str, items: &mut Vec<InputItem>) -> Result<()> {
        let host = scrape::host_of(url)
            .ok_or_else(|| input_error(self.step, format!("cannot parse host from '{}'", url)))?;

        if !is_local_or_test_host(&host) {
            (host.as_str(), 443u16).to_socket_addrs().map_err(|_| {
                input_error(self.step, format!("failed to resolve host '{}'", host))
            })?;
        }

        let client = reqwest::blocking::Client::builder()
            .connect_timeout(URL_CONNECT_TIMEOUT)
            .timeout(URL_OVERALL_TIMEOUT)
            .build()
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        let response = client
            .get(url)
            .send()
            .map_err(|e| input_error(self.step, format!("GET {} failed: {}", url, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(input_error(
                self.step,
                format!("GET {} returned status {}", url, status),
            ));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let extension = if content_type.contains("text/html") {
            "html"
        } else if content_type.contains("application/json") {
            "json"
        } else {
            "txt"
        };

        let body = response
            .bytes()
            .map_err(|e| input_error(self.step, format!("failed to read body of {}: {}", url, e)))?;
        let path = self.temp_path("fetch", extension);
        fs::write(&path, &body)
            .map_err(|e| input_error(self.step, format!("cannot write temp file: {}", e)))?;

        let mut metadata = metadata_for("url");
        metadata.insert("url".to_string(), url.to_string());
        metadata.insert("content_type".to_string(), content_type);
        self.process_path(&path, metadata, items)
    }

    fn process_path(
        &mut self,
        path: &Path,
        metadata: HashMap<String, String>,
        items: &mut Vec<InputItem>,
    ) -> Result<()> {
        if path.is_dir() {
            let children = files::collect_files(path)
                .map_err(|e| input_error(self.step, format!("cannot walk directory: {}", e)))?;
            for child in children {
                self.process_path(&child, metadata.clone(), items)?;
            }
            return Ok(());
        }

        match files::classify(path) {
            FileClass::Image => {
                let bytes = files::read_checked(path)
                    .map_err(|e| input_error(self.step, e.to_string()))?;
                let decoded = image::load_from_memory(&bytes).map_err(|e| {
                    input_error(
                        self.step,
                        format!("cannot decode image '{}': {}", path.display(), e),
                    )
                })?;
                let mut png = Vec::new();
                decoded
                    .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
                    .map_err(|e| {
                        input_error(
                            self.step,
                            format!("cannot encode image '{}': {}", path.display(), e),
                        )
                    })?;

                let normalized = self.temp_path("image", "png");
                fs::write(&normalized, &png).map_err(|e| {
                    input_error(self.step, format!("cannot write temp file: {}", e))
                })?;

                let mut metadata = metadata;
                metadata.insert("original_path".to_string(), path.display().to_string());
                items.push(InputItem::new(
                    InputKind::Image {
                        path: normalized,
                        png_base64: STANDARD.encode(&png),
                    },
                    metadata,
                ));
            }
            FileClass::Document => {
                let bytes = files::read_checked(path)
                    .map_err(|e| input_error(self.step, e.to_string()))?;
                items.push(InputItem::new(
                    InputKind::Document {
                        path: path.to_path_buf(),
                        mime: files::mime_for(path).to_string(),
                        bytes,
                    },
                    metadata,
                ));
            }
            // Text, source code, and unknown extensions all read as text.
            _ => {
                let bytes = files::read_checked(path)
                    .map_err(|e| input_error(self.step, e.to_string()))?;
                items.push(InputItem::new(
                    InputKind::Text {
                        path: path.to_path_buf(),
                        mime: files::mime_for(path).to_string(),
                        bytes,
                    },
                    metadata,
                ));
            }
        }
        Ok(())
    }

    fn temp_path(&mut self, prefix: &str, extension: &str) -> PathBuf {
        self.counter += 1;
        self.temp
            .path()
            .join(format!("{}-{}.{}", prefix, self.counter, extension))
    }
}

fn is_local_or_test_host(host: &str) -> bool {
    host == "localhost" || host == "127.0.0.1" || host.ends_with(".test")
}

fn metadata_for(source: &str) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert("source".to_string(), source.to_string());
    metadata
}

fn input_error(step: &str, message: String) -> EngineError {
    EngineError::InputResolution {
        step: step.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::SpecEntry;

    fn test_fixture() -> (DependencyReport, Collaborators, RunOptions) {
        let env = Environment::default();
        (
            DependencyReport::default(),
            Collaborators::standard(&env),
            RunOptions::default(),
        )
    }

    fn value(s: &str) -> SpecEntry {
        SpecEntry::Value(s.to_string())
    }

    #[test]
    fn na_and_empty_entries_are_skipped() {
        let (report, collaborators, options) = test_fixture();
        let mut resolver = InputResolver::new("s", &report, &collaborators, &options).unwrap();
        let items = resolver
            .resolve(&[value("NA")], None, &mut HashMap::new())
            .unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn stdin_binds_variable_and_materializes_text() {
        let (report, collaborators, options) = test_fixture();
        let mut resolver = InputResolver::new("s", &report, &collaborators, &options).unwrap();
        let mut vars = HashMap::new();
        let items = resolver
            .resolve(&[value("STDIN as $prev")], Some("42"), &mut vars)
            .unwrap();
        assert_eq!(vars.get("prev").unwrap(), "42");
        assert_eq!(items.len(), 1);
        assert!(items[0].is_file());
        assert_eq!(items[0].text_content().unwrap(), "42");
        assert_eq!(items[0].mime().unwrap(), "text/plain");
    }

    #[test]
    fn glob_with_no_matches_fails() {
        let (report, collaborators, options) = test_fixture();
        let mut resolver = InputResolver::new("s", &report, &collaborators, &options).unwrap();
        let err = resolver
            .resolve(
                &[value("/definitely/not/here/*.md")],
                None,
                &mut HashMap::new(),
            )
            .unwrap_err();
        assert!(
            err.to_string().contains("no files found matching pattern"),
            "{}",
            err
        );
    }

    #[test]
    fn missing_path_fails_unless_declared_output() {
        let (mut report, collaborators, options) = test_fixture();
        let mut resolver = InputResolver::new("s", &report, &collaborators, &options).unwrap();
        let err = resolver
            .resolve(&[value("/no/such/file.txt")], None, &mut HashMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("not a declared output"), "{}", err);
        drop(resolver);

        // Declared future outputs resolve to nothing instead of failing.
        let plan = crate::plan::parse_plan_str(
            r#"
early:
  input: /no/such/file.txt
  model: NA
  action: x
  output: STDOUT
late:
  input: NA
  model: NA
  action: y
  output: /no/such/file.txt
"#,
        )
        .unwrap();
        report = crate::deps::analyze(&plan).unwrap();
        let mut resolver =
            InputResolver::new("early", &report, &collaborators, &options).unwrap();
        let items = resolver
            .resolve(&[value("/no/such/file.txt")], None, &mut HashMap::new())
            .unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn directories_recurse_and_images_normalize_to_png() {
        let (report, collaborators, options) = test_fixture();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        image::RgbaImage::from_pixel(2, 2, image::Rgba([1, 2, 3, 255]))
            .save(nested.join("b.bmp"))
            .unwrap();

        let mut resolver = InputResolver::new("s", &report, &collaborators, &options).unwrap();
        let items = resolver
            .resolve(
                &[value(dir.path().to_str().unwrap())],
                None,
                &mut HashMap::new(),
            )
            .unwrap();
        assert_eq!(items.len(), 2);

        let image_item = items
            .iter()
            .find(|i| matches!(i.kind, InputKind::Image { .. }))
            .unwrap();
        assert_eq!(image_item.mime().unwrap(), "image/png");
        assert!(image_item.display_path().ends_with("b.bmp"));
    }

    #[test]
    fn screenshot_is_clipped_and_png_encoded() {
        let (report, _, options) = test_fixture();
        let dir = tempfile::tempdir().unwrap();
        let frame_path = dir.path().join("frame.png");
        image::RgbaImage::from_pixel(2000, 1000, image::Rgba([9, 9, 9, 255]))
            .save(&frame_path)
            .unwrap();

        let env = Environment::default();
        let mut collaborators = Collaborators::standard(&env);
        collaborators.capturer = Box::new(FileBackedCapturer::from_path(frame_path));

        let mut resolver = InputResolver::new("s", &report, &collaborators, &options).unwrap();
        let items = resolver
            .resolve(&[value("screenshot")], None, &mut HashMap::new())
            .unwrap();
        assert_eq!(items.len(), 1);

        let InputKind::Screenshot { png_base64, .. } = &items[0].kind else {
            panic!("expected a screenshot item");
        };
        let png = STANDARD.decode(png_base64).unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!(decoded.width(), 1024);
        assert_eq!(decoded.height(), 768);
    }

    #[test]
    fn capability_classification() {
        let (report, collaborators, options) = test_fixture();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        std::fs::write(dir.path().join("b.pdf"), b"%PDF-1.4").unwrap();

        let mut resolver = InputResolver::new("s", &report, &collaborators, &options).unwrap();
        let items = resolver
            .resolve(
                &[
                    value(dir.path().join("a.txt").to_str().unwrap()),
                    value(dir.path().join("b.pdf").to_str().unwrap()),
                ],
                None,
                &mut HashMap::new(),
            )
            .unwrap();
        let capabilities = required_capabilities(&items);
        assert!(capabilities.contains(&Capability::Text));
        assert!(capabilities.contains(&Capability::File));
        assert!(!capabilities.contains(&Capability::Vision));
    }
}
