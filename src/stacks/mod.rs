//! Stack declarations and their composition into an [`App`].

pub mod api;
pub mod ci;
pub mod network;
pub mod storage;

use crate::core::parser::ValidationError;
use crate::core::stack::App;
use crate::core::types::RailstackConfig;

/// Run every stack's validator over the config.
pub fn validate_stacks(config: &RailstackConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    errors.extend(network::validate(&network::NetworkDescriptor::from_settings(
        &config.network,
    )));
    errors.extend(storage::validate(&storage::StorageDescriptor::from_settings(
        &config.storage,
        config.policy.removal,
    )));
    errors.extend(api::validate(&api::ComputeDescriptor::from_config(config)));
    errors.extend(ci::validate(&ci::PipelineDescriptor::from_settings(
        &config.ci,
        config.policy.removal,
    )));
    errors
}

/// Compose the four stacks. Network first; Storage and API consume its
/// handles; CI stands alone.
///
/// Every stack validator runs first; any finding fails the composition with
/// all messages, one per line.
pub fn compose(config: &RailstackConfig) -> Result<App, String> {
    let errors = validate_stacks(config);
    if !errors.is_empty() {
        return Err(errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("\n"));
    }

    let env = config.env.clone().unwrap_or_default();
    let names = &config.stacks;
    let mut app = App::new(&config.name);

    let (network_stack, net) = network::build(
        &names.network,
        &env,
        &network::NetworkDescriptor::from_settings(&config.network),
    )?;
    app.add_stack(network_stack)?;

    app.add_stack(storage::build(
        &names.storage,
        &env,
        &storage::StorageDescriptor::from_settings(&config.storage, config.policy.removal),
        &net,
    )?)?;

    app.add_stack(api::build(
        &names.api,
        &env,
        &api::ComputeDescriptor::from_config(config),
        &net,
    )?)?;

    app.add_stack(ci::build(
        &names.ci,
        &env,
        &ci::PipelineDescriptor::from_settings(&config.ci, config.policy.removal),
    )?)?;

    tracing::info!(app = %app.name, stacks = app.stacks.len(), "composed app");
    Ok(app)
}
