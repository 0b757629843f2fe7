use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::config_store::Configuration;
use crate::onnx_engine::OnnxEngineConfig;
use crate::twin_transport::MqttTwinConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub device_id: String,
    pub module_id: String,
    pub max_image_bytes: usize,
    pub twin_config: TwinConfig,
    pub upload_config: Option<UploadConfig>,
    pub model_config: ModelConfig,
    pub engine_config: EngineConfig,
    pub defaults: Defaults,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TwinMode {
    Mqtt,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwinConfig {
    pub mode: TwinMode,
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub response_timeout_secs: u64,
    pub max_connect_failures: u32,
    pub local_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub endpoint: String,
    pub container: String,
    #[serde(skip_serializing)]
    pub sas_token: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub work_dir: PathBuf,
    pub load_timeout_secs: u64,
    pub max_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub input_width: u32,
    pub input_height: u32,
    pub confidence_threshold: f32,
    pub intra_threads: usize,
}

/// Startup values for the live configuration, before the first patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    pub send_telemetry: bool,
    pub upload_interval_sec: i64,
    pub inference_mark: bool,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

impl Config {
    pub fn load() -> Result<Self> {
        let api_host = var_or("API_HOST", "0.0.0.0");
        let api_port = parse_or("API_PORT", 8888);

        // Identity injected by the IoT Edge runtime
        let device_id = var_or("IOTEDGE_DEVICEID", "local-device");
        let module_id = var_or("IOTEDGE_MODULEID", "inference");

        let max_image_bytes = parse_or("MAX_IMAGE_BYTES", 20 * 1024 * 1024);

        // Twin transport
        let mode = match var_or("TWIN_MODE", "mqtt").to_lowercase().as_str() {
            "mqtt" => TwinMode::Mqtt,
            "local" => TwinMode::Local,
            other => anyhow::bail!("Unknown TWIN_MODE: {} (expected mqtt or local)", other),
        };

        let twin_config = TwinConfig {
            mode,
            broker_host: var_or("MQTT_BROKER_HOST", "edgeHub"),
            broker_port: parse_or("MQTT_BROKER_PORT", 1883),
            client_id: env::var("MQTT_CLIENT_ID")
                .unwrap_or_else(|_| format!("{}-{}", module_id, uuid::Uuid::new_v4())),
            username: optional("MQTT_USERNAME"),
            password: optional("MQTT_PASSWORD"),
            response_timeout_secs: parse_or("TWIN_RESPONSE_TIMEOUT_SECS", 30),
            max_connect_failures: parse_or("MQTT_MAX_CONNECT_FAILURES", 10),
            local_path: PathBuf::from(var_or("LOCAL_TWIN_PATH", "desired.json")),
        };

        // Blob storage (optional)
        let upload_config = match (optional("BLOB_ENDPOINT"), optional("BLOB_CONTAINER_NAME")) {
            (Some(endpoint), Some(container)) => Some(UploadConfig {
                endpoint,
                container,
                sas_token: optional("BLOB_SAS_TOKEN"),
                timeout_secs: parse_or("BLOB_UPLOAD_TIMEOUT_SECS", 30),
            }),
            _ => None,
        };

        let model_config = ModelConfig {
            work_dir: PathBuf::from(var_or("MODEL_DIR", "model")),
            load_timeout_secs: parse_or("MODEL_LOAD_TIMEOUT_SECS", 300),
            max_bytes: parse_or("MODEL_MAX_BYTES", 512 * 1024 * 1024),
        };

        let engine_config = EngineConfig {
            input_width: parse_or("ENGINE_INPUT_WIDTH", 300),
            input_height: parse_or("ENGINE_INPUT_HEIGHT", 300),
            confidence_threshold: parse_or("ENGINE_CONFIDENCE", 0.5),
            intra_threads: parse_or("ENGINE_THREADS", 4),
        };

        let defaults = Defaults {
            send_telemetry: parse_or("SEND_TELEMETRY", false),
            upload_interval_sec: parse_or("UPLOAD_INTERVAL_SEC", 60),
            inference_mark: parse_or("INFERENCE_MARK", false),
        };

        Ok(Self {
            api_host,
            api_port,
            device_id,
            module_id,
            max_image_bytes,
            twin_config,
            upload_config,
            model_config,
            engine_config,
            defaults,
        })
    }

    pub fn initial_configuration(&self) -> Configuration {
        Configuration {
            telemetry_enabled: self.defaults.send_telemetry,
            annotate_on_score: self.defaults.inference_mark,
            upload_interval_seconds: self.defaults.upload_interval_sec.max(0),
        }
    }

    pub fn mqtt_twin_config(&self) -> MqttTwinConfig {
        MqttTwinConfig {
            broker_host: self.twin_config.broker_host.clone(),
            broker_port: self.twin_config.broker_port,
            client_id: self.twin_config.client_id.clone(),
            username: self.twin_config.username.clone(),
            password: self.twin_config.password.clone(),
            device_id: self.device_id.clone(),
            module_id: self.module_id.clone(),
            response_timeout: Duration::from_secs(self.twin_config.response_timeout_secs),
            max_connect_failures: self.twin_config.max_connect_failures.max(1),
            ..Default::default()
        }
    }

    pub fn onnx_engine_config(&self) -> OnnxEngineConfig {
        OnnxEngineConfig {
            input_width: self.engine_config.input_width,
            input_height: self.engine_config.input_height,
            confidence_threshold: self.engine_config.confidence_threshold,
            intra_threads: self.engine_config.intra_threads,
        }
    }
}
