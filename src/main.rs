// =============================================================================
// VK-PROVISION - headless bootstrap check
// =============================================================================
//
// Runs the whole negotiation against the installed driver without a window:
//
// 1. Load the capability registry (loader, instance version, extensions)
// 2. Build a headless connection from [application] / [instance] / [debug]
// 3. Judge every physical device against [device] and report the verdicts
// 4. Create the logical device with the [queues] layout
// 5. Create the external memory allocator
// 6. Tear everything down in reverse order
//
// =============================================================================

use anyhow::{Context, Result};
use vk_provision::backend::{
    create_allocator, pick_candidate, CapabilityRegistry, DeviceSelector, ExecutionContextBuilder,
    QueueRole,
};
use vk_provision::config::Config;

fn main() -> Result<()> {
    let mut config = Config::load();
    init_logging(&config);
    log::info!("Starting vk-provision check");

    if !config.instance.headless {
        log::info!("No window system here; forcing headless mode");
        config.instance.headless = true;
    }

    let registry = CapabilityRegistry::initialize().context("Failed to load the Vulkan loader")?;
    log::info!(
        "Loader: Vulkan {} ({} instance extensions, {} layers)",
        registry.instance_version(),
        registry.capabilities().extensions.len(),
        registry.capabilities().layers.len()
    );

    let result = run(&config, &registry);
    CapabilityRegistry::terminate();
    result
}

fn init_logging(config: &Config) {
    use env_logger::Builder;

    let mut builder = Builder::from_default_env();
    builder.filter_level(config.log_level());
    builder.init();
}

fn run(config: &Config, registry: &CapabilityRegistry) -> Result<()> {
    let connection = config
        .connection_builder()?
        .build_with(registry)
        .context("Failed to create the Vulkan connection")?;
    log::info!(
        "Connection: Vulkan {}, {} extensions, {} layers",
        connection.api_version(),
        connection.info().enabled_extensions.len(),
        connection.info().enabled_layers.len()
    );

    let result = negotiate_devices(config, &connection);
    connection.destroy();
    result
}

fn negotiate_devices(config: &Config, connection: &vk_provision::backend::Connection) -> Result<()> {
    let selector = DeviceSelector::new(connection).criteria(config.selection_criteria()?);

    let verdicts = selector.enumerate()?;
    for verdict in &verdicts {
        match verdict {
            Ok(device) => log::info!(
                "  [ok] {} ({}, Vulkan {}, {} MiB){}",
                device.name(),
                device.class(),
                device.api_version(),
                device.largest_device_local_heap() / (1024 * 1024),
                if device.is_optimal() { "" } else { " - not optimal" }
            ),
            Err(err) => log::info!("  [rejected] {}", err),
        }
    }

    let physical_device = pick_candidate(verdicts).context("No suitable GPU")?;

    let builder = ExecutionContextBuilder::new(connection, &physical_device);
    let context = config
        .apply_queue_requests(builder)?
        .build()
        .context("Failed to create the logical device")?;

    for role in QueueRole::ALL {
        for queue in context.queues(role) {
            log::info!(
                "  {} queue: family {} index {}{}",
                role,
                queue.family(),
                queue.index(),
                if queue.timeline().is_some() { " (timeline)" } else { "" }
            );
        }
    }

    match create_allocator(connection, &physical_device, &context) {
        Ok(allocator) => {
            log::info!("GPU allocator ready");
            drop(allocator);
        }
        Err(err) => log::warn!("{}", err),
    }

    context.destroy();
    Ok(())
}
