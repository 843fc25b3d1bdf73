//! Stub generation for connect-rs.
//!
//! Two drivers share one emission model:
//!
//! - [`compile_dir`] runs from a `build.rs`, driving `prost-build` with the
//!   Connect service generator and a `pbjson-build` pass for canonical-JSON
//!   serde impls.
//! - `protoc-gen-connect-rs` (the binary in this crate) is a protoc plugin
//!   that consumes a `CodeGeneratorRequest` and emits one
//!   `<input>.connect.rs` file per proto file declaring a service.
//!
//! Per service the output contains a handler trait (the service protocol), a
//! `router` constructor registering every method with the dispatcher, an
//! async client, and a blocking client.

use std::io::Result;
use std::path::{Path, PathBuf};

mod r#gen;
pub mod plugin;

pub use r#gen::ConnectServiceGenerator;

/// How generated method names are spelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MethodNaming {
    /// `GetGreeting` becomes `get_greeting` (the default).
    #[default]
    Snake,
    /// Keep the proto spelling.
    Proto,
}

/// How generated code refers to message types.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TypePathMode {
    /// `super::GreetRequest`, for stubs living next to the prost output (the
    /// default, and the only mode the `prost-build` driver uses).
    #[default]
    Relative,
    /// An absolute path prefix, e.g. `crate::pb`, for stubs generated into a
    /// separate module by the protoc plugin.
    Absolute(String),
}

/// Generator configuration shared by both drivers.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub method_naming: MethodNaming,
    pub type_path: TypePathMode,
    pub build_server: bool,
    pub build_client: bool,
}

impl GeneratorConfig {
    pub fn new() -> Self {
        Self {
            method_naming: MethodNaming::Snake,
            type_path: TypePathMode::Relative,
            build_server: true,
            build_client: true,
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for build-script code generation over a directory of protos.
pub struct CompileBuilder {
    includes_dir: PathBuf,
    config: GeneratorConfig,
    prost_config: Option<Box<dyn FnOnce(&mut prost_build::Config)>>,
}

/// Compile every `.proto` under `includes_dir`.
///
/// ```rust,no_run
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     connect_rs_build::compile_dir("proto").compile()?;
///     Ok(())
/// }
/// ```
pub fn compile_dir(includes_dir: impl AsRef<Path>) -> CompileBuilder {
    CompileBuilder {
        includes_dir: includes_dir.as_ref().to_path_buf(),
        config: GeneratorConfig::new(),
        prost_config: None,
    }
}

impl CompileBuilder {
    /// Keep proto method spellings instead of snake_case.
    pub fn proto_method_names(mut self) -> Self {
        self.config.method_naming = MethodNaming::Proto;
        self
    }

    /// Skip the server trait and router.
    pub fn no_server(mut self) -> Self {
        self.config.build_server = false;
        self
    }

    /// Skip the clients.
    pub fn no_client(mut self) -> Self {
        self.config.build_client = false;
        self
    }

    /// Customize the prost builder. Applied before the internal settings,
    /// which take precedence.
    pub fn with_prost_config<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut prost_build::Config) + 'static,
    {
        self.prost_config = Some(Box::new(f));
        self
    }

    /// Execute code generation.
    pub fn compile(self) -> Result<()> {
        let out_dir = std::env::var("OUT_DIR")
            .map_err(|e| std::io::Error::other(format!("OUT_DIR not set: {e}")))?;
        let descriptor_path = format!("{out_dir}/descriptor.bin");

        let mut proto_files = Vec::new();
        discover_proto_files(&self.includes_dir, &mut proto_files)?;
        if proto_files.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!(
                    "no .proto files found in directory: {}",
                    self.includes_dir.display()
                ),
            ));
        }

        // -------- Pass 1: prost messages + Connect stubs --------
        let mut config = prost_build::Config::default();
        if let Some(config_fn) = self.prost_config {
            config_fn(&mut config);
        }
        config.file_descriptor_set_path(&descriptor_path);
        config.service_generator(Box::new(ConnectServiceGenerator::new(self.config)));
        config.compile_protos(&proto_files, &[&self.includes_dir])?;

        // -------- Pass 2: pbjson canonical-JSON serde impls --------
        let descriptor_bytes = std::fs::read(&descriptor_path)
            .map_err(|e| std::io::Error::other(format!("read descriptor: {e}")))?;
        pbjson_build::Builder::new()
            .register_descriptors(&descriptor_bytes)
            .map_err(|e| std::io::Error::other(format!("register descriptors: {e}")))?
            .build(&["."])
            .map_err(|e| std::io::Error::other(format!("pbjson build: {e}")))?;

        // pbjson-build writes {package}.serde.rs next to the prost output;
        // fold those impls into the main files so a single include! works.
        for entry in std::fs::read_dir(&out_dir)? {
            let path = entry?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(base_name) = file_name.strip_suffix(".serde.rs") else {
                continue;
            };
            let main_file = format!("{out_dir}/{base_name}.rs");
            if Path::new(&main_file).exists() {
                let mut content = std::fs::read_to_string(&main_file)?;
                content.push_str("\n// --- pbjson serde implementations ---\n");
                content.push_str(&std::fs::read_to_string(&path)?);
                std::fs::write(&main_file, content)?;
                let _ = std::fs::remove_file(&path);
            }
        }

        let _ = std::fs::remove_file(&descriptor_path);
        Ok(())
    }
}

fn discover_proto_files(dir: &Path, proto_files: &mut Vec<PathBuf>) -> Result<()> {
    if !dir.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("directory not found: {}", dir.display()),
        ));
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("proto") {
            proto_files.push(path);
        } else if path.is_dir() {
            discover_proto_files(&path, proto_files)?;
        }
    }

    Ok(())
}
