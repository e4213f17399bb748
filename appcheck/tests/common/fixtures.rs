use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::{ImageBuffer, ImageFormat, Rgb};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// A minimal app directory: metadata.json, icon and reset.sql.
pub struct AppFixture {
    pub dir: TempDir,
    pub metadata: PathBuf,
    pub icon: PathBuf,
}

impl AppFixture {
    pub fn new() -> Self {
        crate::test_log!("FIXTURE: Creating app directory");

        let dir = TempDir::new().expect("Failed to create temp dir");
        let metadata = dir.path().join("metadata.json");
        let icon = dir.path().join("icon");

        fs::write(
            &metadata,
            r#"{
  "name": "weather",
  "elionaMinVersion": "v9.0.0",
  "displayName": {"en": "Weather"},
  "description": {"en": "Weather data for assets"},
  "apiUrl": "v1",
  "apiSpecificationPath": "/version/openapi.json",
  "useEnvironment": ["CONNECTION_STRING", "API_ENDPOINT", "API_TOKEN"]
}"#,
        )
        .expect("Failed to write metadata.json");
        fs::write(&icon, png_icon(16)).expect("Failed to write icon");
        fs::write(dir.path().join("reset.sql"), "DELETE FROM public.eliona_app;\n")
            .expect("Failed to write reset.sql");

        Self {
            dir,
            metadata,
            icon,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// `appcheck` with no harness variables inherited from the caller.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_appcheck"));
        cmd.arg("--app").arg(self.path()).env("RUST_LOG", "warn");
        for var in [
            "API_ENDPOINT",
            "API_TOKEN",
            "CONNECTION_STRING",
            "START_MODE",
            "APP_LOCATION",
        ] {
            cmd.env_remove(var);
        }
        cmd
    }
}

/// A PNG data URL the icon check accepts.
pub fn png_icon(size: u32) -> String {
    let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
        ImageBuffer::from_fn(size, size, |x, y| Rgb([(x * 9) as u8, (y * 5) as u8, 200]));
    let mut bytes = Cursor::new(Vec::new());
    img.write_to(&mut bytes, ImageFormat::Png)
        .expect("Failed to encode png");
    format!("data:image/png;base64,{}", STANDARD.encode(bytes.into_inner()))
}
