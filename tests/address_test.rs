use daq_io::address::{GpibAddress, LxiAddress, ModbusAddress, SerialAddress, TcpIpAddress};
use daq_io::{Address, AddressKind};
use daq_io::address::{MAX_GPIB_ADDRESS, MAX_MODBUS_UNIT};
use figment::providers::{Format, Toml};
use proptest::prelude::*;
use serde::Deserialize;

fn samples() -> Vec<Address> {
    vec![
        GpibAddress {
            board: 1,
            address: 22,
        }
        .into(),
        SerialAddress {
            port: "COM3".to_string(),
        }
        .into(),
        TcpIpAddress {
            host: "192.168.1.50".to_string(),
            port: 5025,
        }
        .into(),
        LxiAddress {
            host: "scope.lab.local".to_string(),
        }
        .into(),
        ModbusAddress {
            port: "/dev/ttyUSB1".to_string(),
            unit: 17,
        }
        .into(),
    ]
}

#[test]
fn test_round_trip_every_kind() -> anyhow::Result<()> {
    for address in samples() {
        let text = address.to_string();
        let parsed = Address::parse(&text)?;
        assert_eq!(parsed, address, "round trip of {text}");
    }
    Ok(())
}

/// Host or port names, possibly with `::` inside (IPv6 literals, odd device paths).
fn resource_name() -> impl Strategy<Value = String> {
    "[A-Za-z0-9._/-]{1,12}(::[A-Za-z0-9._/-]{1,8}){0,2}"
}

fn any_address() -> impl Strategy<Value = Address> {
    prop_oneof![
        (any::<u16>(), 0..=MAX_GPIB_ADDRESS)
            .prop_map(|(board, address)| Address::from(GpibAddress { board, address })),
        resource_name().prop_map(|port| Address::from(SerialAddress { port })),
        (resource_name(), any::<u16>())
            .prop_map(|(host, port)| Address::from(TcpIpAddress { host, port })),
        resource_name().prop_map(|host| Address::from(LxiAddress { host })),
        (resource_name(), 0..=MAX_MODBUS_UNIT)
            .prop_map(|(port, unit)| Address::from(ModbusAddress { port, unit })),
    ]
}

proptest! {
    #[test]
    fn test_generated_addresses_round_trip(address in any_address()) {
        let text = address.to_string();
        let parsed = Address::parse(&text).unwrap();
        prop_assert_eq!(&parsed, &address, "round trip of {}", text);
        prop_assert_eq!(parsed.to_string(), text);
    }
}

#[test]
fn test_ipv6_host_keeps_its_colons() -> anyhow::Result<()> {
    let socket = Address::parse("TCPIP0::fe80::1::5025::SOCKET")?;
    assert_eq!(
        socket.to_tcpip(),
        Some(TcpIpAddress {
            host: "fe80::1".to_string(),
            port: 5025
        })
    );
    let lxi = Address::parse("TCPIP0::fe80::1::INSTR")?;
    assert_eq!(lxi.to_lxi().map(|a| a.host).as_deref(), Some("fe80::1"));
    Ok(())
}

#[test]
fn test_narrowing_is_exclusive() {
    for address in samples() {
        let matches = [
            address.to_gpib().is_some(),
            address.to_serial().is_some(),
            address.to_tcpip().is_some(),
            address.to_lxi().is_some(),
            address.to_modbus().is_some(),
        ];
        assert_eq!(matches.iter().filter(|m| **m).count(), 1, "{address}");
    }
}

#[test]
fn test_addresses_in_config_files() -> anyhow::Result<()> {
    #[derive(Deserialize)]
    struct Bench {
        smu: Address,
        controller: Address,
    }

    let bench: Bench = figment::Figment::from(Toml::string(
        r#"
        smu = "gpib0::24::instr"
        controller = "MODBUS::COM4::2::INSTR"
        "#,
    ))
    .extract()?;
    assert_eq!(bench.smu.to_string(), "GPIB0::24::INSTR");
    assert_eq!(bench.controller.kind(), AddressKind::Modbus);

    let broken: Result<Bench, _> = figment::Figment::from(Toml::string(
        r#"
        smu = "USB0::1::INSTR"
        controller = "MODBUS::COM4::2::INSTR"
        "#,
    ))
    .extract();
    assert!(broken.is_err());
    Ok(())
}
