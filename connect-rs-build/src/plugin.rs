//! The protoc plugin driver.
//!
//! Reads a `CodeGeneratorRequest` from stdin, emits one `<input>.connect.rs`
//! file per requested proto file that declares at least one service, and
//! writes the `CodeGeneratorResponse` to stdout. Editions up to 2023 are
//! declared as supported.

use std::io::{Read, Result, Write};

use convert_case::{Case, Casing};
use prost::Message;
use prost_types::compiler::code_generator_response::{Feature, File};
use prost_types::compiler::{CodeGeneratorRequest, CodeGeneratorResponse};
use prost_types::{FileDescriptorProto, MethodDescriptorProto};

use crate::r#gen::{Idempotency, MethodKind, MethodModel, ServiceModel, emit_service};
use crate::{GeneratorConfig, MethodNaming, TypePathMode};

/// Entry point for the `protoc-gen-connect-rs` binary.
pub fn run() -> Result<()> {
    let mut input = Vec::new();
    std::io::stdin().read_to_end(&mut input)?;
    let request = CodeGeneratorRequest::decode(&input[..])
        .map_err(|e| std::io::Error::other(format!("decode CodeGeneratorRequest: {e}")))?;

    let config = parse_parameter(request.parameter());
    let response = generate(&request, &config);

    let mut output = Vec::new();
    response
        .encode(&mut output)
        .map_err(|e| std::io::Error::other(format!("encode CodeGeneratorResponse: {e}")))?;
    std::io::stdout().write_all(&output)
}

/// Parse the protoc `--connect-rs_opt` parameter string:
/// comma-separated `key=value` pairs.
fn parse_parameter(parameter: &str) -> GeneratorConfig {
    let mut config = GeneratorConfig::new();
    for pair in parameter.split(',') {
        match pair.split_once('=').unwrap_or((pair, "")) {
            ("method_naming", "proto") => config.method_naming = MethodNaming::Proto,
            ("method_naming", _) => config.method_naming = MethodNaming::Snake,
            ("message_path", prefix) if !prefix.is_empty() => {
                config.type_path = TypePathMode::Absolute(prefix.to_string());
            }
            ("server", "false") => config.build_server = false,
            ("client", "false") => config.build_client = false,
            _ => {}
        }
    }
    config
}

/// Generate the response for a request. One output file per input proto file
/// with services; the file name is the input path with `.proto` replaced by
/// `.connect.rs`.
pub fn generate(request: &CodeGeneratorRequest, config: &GeneratorConfig) -> CodeGeneratorResponse {
    let mut response = CodeGeneratorResponse {
        supported_features: Some(
            (Feature::Proto3Optional as u64) | (Feature::SupportsEditions as u64),
        ),
        minimum_edition: Some(prost_types::Edition::Proto2 as i32),
        maximum_edition: Some(prost_types::Edition::Edition2023 as i32),
        ..Default::default()
    };

    for file_name in &request.file_to_generate {
        let Some(file) = request.proto_file.iter().find(|f| f.name() == file_name) else {
            continue;
        };
        if file.service.is_empty() {
            continue;
        }

        let mut content = String::from(
            "// This file is @generated by protoc-gen-connect-rs.\n\
             #![allow(clippy::all)]\n\n",
        );
        for service in &file.service {
            let model = ServiceModel {
                package: file.package().to_string(),
                proto_name: service.name().to_string(),
                methods: service
                    .method
                    .iter()
                    .map(|method| method_model(file, method, config))
                    .collect(),
            };
            emit_service(&model, config, &mut content);
        }

        response.file.push(File {
            name: Some(output_name(file_name)),
            content: Some(content),
            ..Default::default()
        });
    }

    response
}

fn output_name(input: &str) -> String {
    match input.strip_suffix(".proto") {
        Some(stem) => format!("{stem}.connect.rs"),
        None => format!("{input}.connect.rs"),
    }
}

fn method_model(
    file: &FileDescriptorProto,
    method: &MethodDescriptorProto,
    config: &GeneratorConfig,
) -> MethodModel {
    let kind = match (method.client_streaming(), method.server_streaming()) {
        (false, false) => MethodKind::Unary,
        (true, false) => MethodKind::ClientStream,
        (false, true) => MethodKind::ServerStream,
        (true, true) => MethodKind::BidiStream,
    };
    let idempotency = match method
        .options
        .as_ref()
        .map(|options| options.idempotency_level())
    {
        Some(prost_types::method_options::IdempotencyLevel::NoSideEffects) => {
            Idempotency::NoSideEffects
        }
        Some(prost_types::method_options::IdempotencyLevel::Idempotent) => Idempotency::Idempotent,
        _ => Idempotency::Unknown,
    };

    MethodModel {
        proto_name: method.name().to_string(),
        input_type: rust_type_path(file, method.input_type(), config),
        output_type: rust_type_path(file, method.output_type(), config),
        kind,
        idempotency,
    }
}

/// Map a fully-qualified proto type name (`.pkg.Outer.Inner`) to the Rust
/// path prost generates for it: nested messages live in snake_case modules
/// named after their parents.
fn rust_type_path(file: &FileDescriptorProto, type_name: &str, config: &GeneratorConfig) -> String {
    let name = type_name.strip_prefix('.').unwrap_or(type_name);
    let relative = match name.strip_prefix(&format!("{}.", file.package())) {
        Some(relative) => relative,
        // Types from another package keep their dotted name; the caller's
        // message_path prefix is expected to cover them.
        None => name,
    };

    let segments: Vec<&str> = relative.split('.').collect();
    let mut path = String::new();
    if let TypePathMode::Absolute(prefix) = &config.type_path {
        path.push_str(prefix);
        path.push_str("::");
    }
    for parent in &segments[..segments.len() - 1] {
        path.push_str(&parent.to_case(Case::Snake));
        path.push_str("::");
    }
    path.push_str(segments[segments.len() - 1]);
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_types::{DescriptorProto, ServiceDescriptorProto};

    fn sample_request() -> CodeGeneratorRequest {
        CodeGeneratorRequest {
            file_to_generate: vec!["greet/v1/greet.proto".into(), "greet/v1/empty.proto".into()],
            proto_file: vec![
                FileDescriptorProto {
                    name: Some("greet/v1/greet.proto".into()),
                    package: Some("greet.v1".into()),
                    message_type: vec![
                        DescriptorProto {
                            name: Some("GreetRequest".into()),
                            ..Default::default()
                        },
                        DescriptorProto {
                            name: Some("GreetResponse".into()),
                            ..Default::default()
                        },
                    ],
                    service: vec![ServiceDescriptorProto {
                        name: Some("GreetService".into()),
                        method: vec![MethodDescriptorProto {
                            name: Some("Greet".into()),
                            input_type: Some(".greet.v1.GreetRequest".into()),
                            output_type: Some(".greet.v1.GreetResponse".into()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                FileDescriptorProto {
                    name: Some("greet/v1/empty.proto".into()),
                    package: Some("greet.v1".into()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn one_output_file_per_proto_with_services() {
        let response = generate(&sample_request(), &GeneratorConfig::new());
        assert_eq!(response.file.len(), 1);
        assert_eq!(response.file[0].name(), "greet/v1/greet.connect.rs");
        assert!(response.file[0].content().contains("pub trait GreetService"));
    }

    #[test]
    fn declares_editions_support_up_to_2023() {
        let response = generate(&sample_request(), &GeneratorConfig::new());
        let features = response.supported_features.unwrap();
        assert_ne!(features & Feature::SupportsEditions as u64, 0);
        assert_eq!(
            response.maximum_edition,
            Some(prost_types::Edition::Edition2023 as i32)
        );
    }

    #[test]
    fn type_paths_resolve_package_and_nesting() {
        let file = FileDescriptorProto {
            package: Some("greet.v1".into()),
            ..Default::default()
        };
        let config = GeneratorConfig::new();
        assert_eq!(
            rust_type_path(&file, ".greet.v1.GreetRequest", &config),
            "GreetRequest"
        );
        assert_eq!(
            rust_type_path(&file, ".greet.v1.Outer.Inner", &config),
            "outer::Inner"
        );

        let absolute = GeneratorConfig {
            type_path: TypePathMode::Absolute("crate::pb".into()),
            ..GeneratorConfig::new()
        };
        assert_eq!(
            rust_type_path(&file, ".greet.v1.GreetRequest", &absolute),
            "crate::pb::GreetRequest"
        );
    }

    #[test]
    fn parameter_parsing() {
        let config = parse_parameter("method_naming=proto,server=false,message_path=crate::pb");
        assert_eq!(config.method_naming, MethodNaming::Proto);
        assert!(!config.build_server);
        assert_eq!(config.type_path, TypePathMode::Absolute("crate::pb".into()));
    }
}
