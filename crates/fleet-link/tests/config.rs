use fleet_link::doctor;
use fleet_link::{ProtocolConfig, VehicleConfig, DEFAULT_BAUD};
use serde::Deserialize;

#[derive(Deserialize)]
struct Doc {
    #[serde(default)]
    protocol: ProtocolConfig,
    vehicles: Vec<VehicleConfig>,
}

#[test]
fn partial_protocol_table_keeps_defaults() {
    let doc: Doc = toml::from_str(
        r#"
        [protocol]
        item_timeout_ms = 1500
        silence_retries = 5

        [[vehicles]]
        id = 1
        endpoint = "udpin:0.0.0.0:14550"

        [[vehicles]]
        id = 2
        endpoint = "serial:/dev/ttyUSB0"
        baud = 115200
        "#,
    )
    .unwrap();

    assert_eq!(doc.protocol.item_timeout_ms, 1500);
    assert_eq!(doc.protocol.silence_retries, 5);
    assert_eq!(doc.protocol.ack_timeout_ms, ProtocolConfig::default().ack_timeout_ms);
    assert_eq!(doc.protocol.stale_threshold().as_millis(), 2000);
    assert_eq!(doc.vehicles[0].baud, DEFAULT_BAUD);
    assert_eq!(doc.vehicles[1].baud, 115200);

    doctor::check_protocol(&doc.protocol).unwrap();
    doctor::check_vehicles(&doc.vehicles).unwrap();
}

#[test]
fn missing_protocol_table_is_all_defaults() {
    let doc: Doc = toml::from_str("[[vehicles]]\nid = 7\nendpoint = \"udpout:10.0.0.2:14555\"\n").unwrap();
    assert_eq!(doc.protocol.gcs_system_id, 255);
    assert_eq!(doc.protocol.gcs_component_id, 190);
    assert_eq!(doc.protocol.download_retries, 3);
    assert_eq!(doc.vehicles[0].id, 7);
}
