// =============================================================================
// CONFIGURATION - Load bootstrap settings from config.toml
// =============================================================================
//
// Every section maps onto one builder: [instance] onto ConnectionBuilder,
// [device] onto SelectionCriteria, [queues] onto ExecutionContextBuilder and
// [presentation] onto RingSettings. Missing keys fall back to defaults.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;

use crate::backend::device::ExecutionContextBuilder;
use crate::backend::instance::{ConnectionBuilder, Diagnostics};
use crate::backend::physical_device::{DeviceClass, QueueRequirement, QueueRole, SelectionCriteria};
use crate::backend::swapchain::{AuxResources, RingSettings};
use crate::backend::tier::Tiered;
use crate::backend::version::ApiVersion;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub application: ApplicationConfig,
    pub instance: InstanceConfig,
    pub device: DeviceConfig,
    pub queues: QueuesConfig,
    pub presentation: PresentationConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    pub version: [u32; 3],
    pub engine_name: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "vk-provision".to_string(),
            version: [0, 1, 0],
            engine_name: "vk-provision".to_string(),
        }
    }
}

/// Versions are written "1.2" or "1.2.0".
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct InstanceConfig {
    pub api_version: Option<String>,
    pub requested_api_version: Option<String>,
    pub extensions: Vec<String>,
    pub requested_extensions: Vec<String>,
    pub layers: Vec<String>,
    pub requested_layers: Vec<String>,
    pub headless: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: Option<String>,
    pub preferred_class: String,
    pub allow_any_class: bool,
    pub api_version: Option<String>,
    pub requested_api_version: Option<String>,
    pub extensions: Vec<String>,
    pub requested_extensions: Vec<String>,
    pub required_memory_mb: u64,
    pub requested_memory_mb: u64,
    /// "none", "any", "separate" or "dedicated"
    pub compute_queue: String,
    pub transfer_queue: String,
    pub portability_subset: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: None,
            preferred_class: "discrete".to_string(),
            allow_any_class: true,
            api_version: None,
            requested_api_version: None,
            extensions: Vec::new(),
            requested_extensions: Vec::new(),
            required_memory_mb: 0,
            requested_memory_mb: 0,
            compute_queue: "none".to_string(),
            transfer_queue: "none".to_string(),
            portability_subset: false,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct QueuesConfig {
    pub request: Vec<QueueRequestConfig>,
}

/// One `[[queues.request]]` entry.
#[derive(Debug, Deserialize)]
pub struct QueueRequestConfig {
    pub role: String,
    pub priorities: Vec<f32>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PresentationConfig {
    /// Most preferred first.
    pub present_modes: Vec<String>,
    pub image_count: u32,
    pub min_image_count: u32,
    pub width: u32,
    pub height: u32,
    pub frames_in_flight: u32,
    pub image_views: bool,
    pub depth_buffers: bool,
    pub sync_objects: bool,
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            present_modes: vec!["mailbox".to_string(), "fifo".to_string()],
            image_count: 3,
            min_image_count: 0,
            width: 1280,
            height: 720,
            frames_in_flight: 2,
            image_views: true,
            depth_buffers: false,
            sync_objects: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    /// Fail instead of continuing when validation is unavailable.
    pub validation_required: bool,
    pub log_level: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            validation_required: false,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.debug.log_level.parse().unwrap_or_else(|_| {
            eprintln!("Unknown log level '{}', defaulting to info", self.debug.log_level);
            log::LevelFilter::Info
        })
    }

    pub fn diagnostics(&self) -> Diagnostics {
        match (self.debug.validation_layers, self.debug.validation_required) {
            (false, _) => Diagnostics::Disabled,
            (true, false) => Diagnostics::Requested,
            (true, true) => Diagnostics::Required,
        }
    }

    pub fn connection_builder(&self) -> Result<ConnectionBuilder> {
        let app = &self.application;
        let instance = &self.instance;
        let mut builder = ConnectionBuilder::new(app.name.clone())
            .application_version(app.version[0], app.version[1], app.version[2])
            .engine_name(app.engine_name.clone())
            .headless(instance.headless)
            .diagnostics(self.diagnostics());

        if let Some(version) = &instance.api_version {
            builder = builder.require_api_version(parse_version(version)?);
        }
        if let Some(version) = &instance.requested_api_version {
            builder = builder.request_api_version(parse_version(version)?);
        }
        for name in &instance.extensions {
            builder = builder.require_extension(name.clone());
        }
        for name in &instance.requested_extensions {
            builder = builder.request_extension(name.clone());
        }
        for name in &instance.layers {
            builder = builder.require_layer(name.clone());
        }
        for name in &instance.requested_layers {
            builder = builder.request_layer(name.clone());
        }
        Ok(builder)
    }

    /// Device criteria. Presentation is required unless running headless.
    pub fn selection_criteria(&self) -> Result<SelectionCriteria> {
        let device = &self.device;
        let mut criteria = SelectionCriteria {
            name: device.name.clone(),
            allow_any_class: device.allow_any_class,
            portability_subset: device.portability_subset,
            ..Default::default()
        };

        criteria.preferred_class = DeviceClass::from_name(&device.preferred_class).unwrap_or_else(|| {
            log::warn!(
                "Unknown device class '{}', defaulting to discrete",
                device.preferred_class
            );
            DeviceClass::Discrete
        });

        let required = match &device.api_version {
            Some(version) => parse_version(version)?,
            None => ApiVersion::V1_0,
        };
        let requested = match &device.requested_api_version {
            Some(version) => parse_version(version)?,
            None => required,
        };
        criteria.version = Tiered::new(ApiVersion::V1_0)
            .with_required(required)
            .with_requested(requested.max(required));

        for name in &device.extensions {
            criteria.extensions.require(name.clone());
        }
        for name in &device.requested_extensions {
            criteria.extensions.request(name.clone());
        }

        let mib = 1024 * 1024;
        criteria.memory = Tiered::new(0)
            .with_required(device.required_memory_mb * mib)
            .with_requested(device.requested_memory_mb.max(device.required_memory_mb) * mib);

        criteria.topology.present = !self.instance.headless;
        criteria.topology.compute = parse_queue_requirement(&device.compute_queue);
        criteria.topology.transfer = parse_queue_requirement(&device.transfer_queue);

        Ok(criteria)
    }

    /// Add every `[[queues.request]]` entry to `builder`.
    pub fn apply_queue_requests<'a>(&self, mut builder: ExecutionContextBuilder<'a>) -> Result<ExecutionContextBuilder<'a>> {
        for request in &self.queues.request {
            let role = parse_queue_role(&request.role)?;
            builder = if request.required {
                builder.require_queues(role, &request.priorities)
            } else {
                builder.request_queues(role, &request.priorities)
            };
        }
        Ok(builder)
    }

    pub fn ring_settings(&self) -> RingSettings {
        let presentation = &self.presentation;
        let present_modes = presentation
            .present_modes
            .iter()
            .map(|name| parse_present_mode(name))
            .collect();

        RingSettings {
            present_modes,
            image_count: Tiered::new(0)
                .with_required(presentation.min_image_count)
                .with_requested(presentation.image_count.max(presentation.min_image_count)),
            extent: vk::Extent2D {
                width: presentation.width,
                height: presentation.height,
            },
            frames_in_flight: presentation.frames_in_flight,
            aux: AuxResources {
                image_views: presentation.image_views,
                depth_buffers: presentation.depth_buffers,
                framebuffers: false,
                sync_objects: presentation.sync_objects,
            },
            ..Default::default()
        }
    }
}

/// "1.2" or "1.2.3".
pub fn parse_version(text: &str) -> Result<ApiVersion> {
    let parts = text
        .trim()
        .split('.')
        .map(|part| part.parse::<u32>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Invalid API version '{}'", text))?;

    match parts.as_slice() {
        [major, minor] => Ok(ApiVersion::new(*major, *minor, 0)),
        [major, minor, patch] => Ok(ApiVersion::new(*major, *minor, *patch)),
        _ => anyhow::bail!("Invalid API version '{}': expected MAJOR.MINOR[.PATCH]", text),
    }
}

/// Get present mode as Vulkan enum
pub fn parse_present_mode(name: &str) -> vk::PresentModeKHR {
    match name.to_lowercase().as_str() {
        "immediate" => vk::PresentModeKHR::IMMEDIATE,
        "mailbox" => vk::PresentModeKHR::MAILBOX,
        "fifo" => vk::PresentModeKHR::FIFO,
        "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
        _ => {
            log::warn!("Unknown present mode '{}', defaulting to FIFO", name);
            vk::PresentModeKHR::FIFO
        }
    }
}

pub fn parse_queue_requirement(name: &str) -> QueueRequirement {
    match name.to_lowercase().as_str() {
        "none" | "" => QueueRequirement::None,
        "any" => QueueRequirement::Any,
        "separate" => QueueRequirement::Separate,
        "dedicated" => QueueRequirement::Dedicated,
        _ => {
            log::warn!("Unknown queue requirement '{}', ignoring", name);
            QueueRequirement::None
        }
    }
}

pub fn parse_queue_role(name: &str) -> Result<QueueRole> {
    match name.to_lowercase().as_str() {
        "graphics" => Ok(QueueRole::Graphics),
        "compute" => Ok(QueueRole::Compute),
        "transfer" => Ok(QueueRole::Transfer),
        "present" => Ok(QueueRole::Present),
        _ => anyhow::bail!("Unknown queue role '{}'", name),
    }
}
