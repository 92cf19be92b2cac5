use color_eyre::eyre::{Result, WrapErr};
use opentelemetry::sdk::resource::Resource;
use opentelemetry::sdk::trace;
use opentelemetry::KeyValue;

use tracing_error::ErrorLayer;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::filter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use std::net::IpAddr;

const BASE_FILTER: &str = "info,disknode=debug,client=info,discovery=warn";

fn opentelemetry<S>(
    instance: String,
    endpoint: IpAddr,
    run: u16,
) -> Result<OpenTelemetryLayer<S, opentelemetry::sdk::trace::Tracer>>
where
    S: tracing::subscriber::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    opentelemetry::global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());

    let run_numb = run.to_string();
    let resouces = vec![
        KeyValue::new("instance", instance),
        KeyValue::new("run", run_numb),
    ];
    let config = trace::Config::default().with_resource(Resource::new(resouces));

    let tracer = opentelemetry_jaeger::new_pipeline()
        .with_trace_config(config)
        .with_agent_endpoint((endpoint, 6831))
        .with_auto_split_batch(true)
        .with_service_name("disknode")
        .install_batch(opentelemetry::runtime::Tokio)
        .wrap_err("could not set up jaeger pipeline")?;

    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

/// Logs to stdout, and to jaeger if an `endpoint` is given. `RUST_LOG`
/// is added to the default filter.
pub fn setup_tracing(instance: String, endpoint: Option<IpAddr>, run: u16) -> Result<()> {
    let extra = std::env::var("RUST_LOG").unwrap_or_default();
    let filter = filter::EnvFilter::builder()
        .parse(format!("{BASE_FILTER},{extra}"))
        .wrap_err("invalid log filter")?;

    let uptime = fmt::time::uptime();
    if let Some(endpoint) = endpoint {
        // ugly code duplication, needed or generics get angry
        let fmt_layer = fmt::layer()
            .pretty()
            .with_line_number(true)
            .with_timer(uptime);

        let telemetry = opentelemetry(instance, endpoint, run)?;
        let _ignore_err = tracing_subscriber::registry()
            .with(ErrorLayer::default())
            .with(filter)
            .with(telemetry)
            .with(fmt_layer)
            .try_init();
    } else {
        let fmt_layer = fmt::layer()
            .pretty()
            .with_line_number(true)
            .with_timer(uptime);
        let _ignore_err = tracing_subscriber::registry()
            .with(ErrorLayer::default())
            .with(filter)
            .with(fmt_layer)
            .try_init();
    }
    Ok(())
}

pub fn setup_test_tracing(additional_filter: &str) {
    let filter = filter::EnvFilter::builder()
        .parse(format!("{BASE_FILTER},{additional_filter}"))
        .unwrap_or_else(|_| filter::EnvFilter::new(BASE_FILTER));

    let fmt = fmt::layer()
        .pretty()
        .with_line_number(true)
        .with_test_writer();

    let _ignore_err = tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(filter)
        .with(fmt)
        .try_init();
}

pub fn setup_errors() -> Result<()> {
    color_eyre::install()
}
