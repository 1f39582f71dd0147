use {
    hyper::{
        server::conn::AddrStream,
        service::{make_service_fn, service_fn},
        Body, Request, Response, Server, StatusCode,
    },
    lazy_static::lazy_static,
    prometheus::{IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder},
    std::{net::SocketAddr, sync::Once, time::SystemTime},
    tracing::{error, info},
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    static ref DROPPED_MESSAGES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("dropped_messages", "Records whose delivery failed and which are not mirrored"),
        &["client_id"]
    ).unwrap();

    static ref MIRRORED_MESSAGES: IntCounterVec = IntCounterVec::new(
        Opts::new("mirrored_messages_total", "Records acknowledged by the destination cluster"),
        &["client_id"]
    ).unwrap();

    static ref IN_FLIGHT_RECORDS: IntGauge = IntGauge::new(
        "in_flight_records", "Records handed to the producer without a delivery report yet"
    ).unwrap();

    static ref LAST_COMMIT_TIMESTAMP: IntGauge = IntGauge::new(
        "last_commit_timestamp_seconds", "Unix time of the most recent successful offset commit"
    ).unwrap();
}

pub fn run_server(address: SocketAddr) -> anyhow::Result<()> {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| {
        macro_rules! register {
            ($collector:ident) => {
                REGISTRY
                    .register(Box::new($collector.clone()))
                    .expect("collector can't be registered");
            };
        }
        register!(DROPPED_MESSAGES);
        register!(MIRRORED_MESSAGES);
        register!(IN_FLIGHT_RECORDS);
        register!(LAST_COMMIT_TIMESTAMP);
    });

    let make_service = make_service_fn(move |_: &AddrStream| async move {
        Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => metrics_handler(),
                _ => not_found_handler(),
            };
            Ok::<_, hyper::Error>(response)
        }))
    });
    let server = Server::try_bind(&address)?.serve(make_service);
    info!("start prometheus server: {address:?}");
    tokio::spawn(async move {
        if let Err(error) = server.await {
            error!("prometheus server failed: {error:?}");
        }
    });
    Ok(())
}

fn metrics_handler() -> Response<Body> {
    let metrics = TextEncoder::new()
        .encode_to_string(&REGISTRY.gather())
        .unwrap_or_else(|error| {
            error!("could not encode custom metrics: {}", error);
            String::new()
        });
    Response::builder().body(Body::from(metrics)).unwrap()
}

fn not_found_handler() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::empty())
        .unwrap()
}

pub fn dropped_messages_inc(client_id: &str) {
    DROPPED_MESSAGES.with_label_values(&[client_id]).inc();
}

pub fn mirrored_messages_inc(client_id: &str) {
    MIRRORED_MESSAGES.with_label_values(&[client_id]).inc();
}

pub fn in_flight_records_set(count: i64) {
    IN_FLIGHT_RECORDS.set(count);
}

pub fn last_commit_timestamp_update() {
    if let Ok(elapsed) = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        LAST_COMMIT_TIMESTAMP.set(elapsed.as_secs() as i64);
    }
}
