use axum::http::{HeaderName, HeaderValue, Method};
use axum::Router;
use candle::utils::{cuda_is_available, metal_is_available};
use candle::{DType, Device, Result};
use candle_core as candle;
use config::{CorsSettings, ServerSettings};
use openai::openai_server::openai_router;
use openai::OpenAIServerData;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub mod config;
pub mod engine_state;
pub mod openai;

/// Select a device from its name: `auto`, `cpu`, `cuda`, `cuda:<ordinal>`,
/// `metal` or `mps`. `auto` prefers CUDA, then Metal, then the CPU.
pub fn new_device(name: &str) -> Result<Device> {
    let name = name.trim().to_lowercase();
    match name.as_str() {
        "auto" => {
            if cuda_is_available() {
                Device::new_cuda(0)
            } else if metal_is_available() {
                Device::new_metal(0)
            } else {
                #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
                {
                    warn!("Running on CPU, to run on GPU(metal), build with `--features metal`");
                }
                #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
                {
                    warn!("Running on CPU, to run on GPU, build with `--features cuda`");
                }
                Ok(Device::Cpu)
            }
        }
        "cpu" => Ok(Device::Cpu),
        "cuda" | "gpu" => Device::new_cuda(0),
        "metal" | "mps" => Device::new_metal(0),
        other => match other.strip_prefix("cuda:").map(str::parse::<usize>) {
            Some(Ok(ordinal)) => Device::new_cuda(ordinal),
            _ => Err(candle::Error::msg(format!("Unsupported device '{name}'"))),
        },
    }
}

/// Weight precision. `auto` is bfloat16 on accelerators and float32 on CPU.
pub fn parse_dtype(precision: &str, device: &Device) -> Result<DType> {
    match precision.trim().to_lowercase().as_str() {
        "bfloat16" | "bf16" => Ok(DType::BF16),
        "float16" | "f16" | "half" => Ok(DType::F16),
        "float32" | "f32" | "float" => Ok(DType::F32),
        "auto" if device.is_cpu() => Ok(DType::F32),
        "auto" => Ok(DType::BF16),
        other => Err(candle::Error::msg(format!("Unsupported precision '{other}'"))),
    }
}

/// Shard files referenced by a safetensors index, relative to `path`.
pub fn hub_load_local_safetensors(path: &Path, json_file: &str) -> Result<Vec<PathBuf>> {
    info!("{}", path.join(json_file).display());
    let jsfile = std::fs::File::open(path.join(json_file))?;
    let json: serde_json::Value = serde_json::from_reader(&jsfile).map_err(candle::Error::wrap)?;
    let weight_map = match json.get("weight_map") {
        Some(serde_json::Value::Object(map)) => map,
        Some(_) => candle::bail!("weight map in {json_file:?} is not a map"),
        None => candle::bail!("no weight map in {json_file:?}"),
    };
    let safetensors_files: BTreeSet<&str> =
        weight_map.values().filter_map(|v| v.as_str()).collect();
    Ok(safetensors_files
        .into_iter()
        .map(|file| path.join(file))
        .collect())
}

fn cors_layer(settings: &CorsSettings) -> anyhow::Result<CorsLayer> {
    let wildcard = |values: &[String]| values.iter().any(|v| v == "*");
    // Browsers reject `*` on credentialed requests, so wildcards echo the request instead.
    let credentials = settings.allow_credentials;

    let origins = if wildcard(&settings.allow_origins) {
        if credentials {
            AllowOrigin::mirror_request()
        } else {
            AllowOrigin::any()
        }
    } else {
        AllowOrigin::list(
            settings
                .allow_origins
                .iter()
                .map(|o| HeaderValue::from_str(o))
                .collect::<std::result::Result<Vec<_>, _>>()?,
        )
    };
    let methods = if wildcard(&settings.allow_methods) {
        if credentials {
            AllowMethods::mirror_request()
        } else {
            AllowMethods::any()
        }
    } else {
        AllowMethods::list(
            settings
                .allow_methods
                .iter()
                .map(|m| Method::from_bytes(m.to_uppercase().as_bytes()))
                .collect::<std::result::Result<Vec<_>, _>>()?,
        )
    };
    let headers = if wildcard(&settings.allow_headers) {
        if credentials {
            AllowHeaders::mirror_request()
        } else {
            AllowHeaders::any()
        }
    } else {
        AllowHeaders::list(
            settings
                .allow_headers
                .iter()
                .map(|h| HeaderName::from_bytes(h.as_bytes()))
                .collect::<std::result::Result<Vec<_>, _>>()?,
        )
    };

    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
        .allow_credentials(credentials))
}

/// The complete HTTP application: API routes mounted under `root_path`,
/// optional CORS and request tracing.
pub fn build_app(
    data: Arc<OpenAIServerData>,
    server: &ServerSettings,
    cors: &CorsSettings,
) -> anyhow::Result<Router> {
    let api = openai_router(data);
    let root_path = server.root_path.trim().trim_end_matches('/');
    let mut app = if root_path.is_empty() {
        api
    } else if root_path.starts_with('/') {
        Router::new().nest(root_path, api)
    } else {
        Router::new().nest(&format!("/{root_path}"), api)
    };
    if cors.enabled {
        app = app.layer(cors_layer(cors)?);
    }
    Ok(app.layer(TraceLayer::new_for_http()))
}
