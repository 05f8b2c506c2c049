//! End-to-end port connection over emulated devices.
//!
//! Two emulated PCI-style devices, one producer port and one consumer
//! port, driven through the full descriptor exchange. Verifies role
//! resolution, OCDP register programming, data-mover bring-up, and the
//! buffer-size compatibility checks.

use occp_chip::{ocdp, worker, worker_config_offset, worker_control_offset, OCCP_SPACE_SIZE};
use occp_driver::sim::SimDevice;
use occp_driver::{
    Access, ControlOp, Device, Port, PortConfig, PortRole, SharedAccessor,
};
use std::sync::{Arc, Mutex};

const OCDP_WORKER: usize = 2;
const OCDP_MEMORY: u32 = 0x8000;

fn sim_hdl_device(name: &str, endpoint_addr: u64) -> (Device, Arc<Mutex<SimDevice>>) {
    let sim = SimDevice::shared("ml605", "xc6vlx240t");
    sim.lock().expect("sim").install_ocdp(OCDP_WORKER, OCDP_MEMORY);
    let acc: SharedAccessor = sim.clone();
    let c = Access::remote(acc.clone(), 0, endpoint_addr);
    let d = Access::remote(acc, 0, endpoint_addr + OCCP_SPACE_SIZE);
    let mut dev = Device::new(
        name,
        "ocpi-dma-pio",
        c,
        d,
        format!("ocpi-dma-pio:{endpoint_addr:#x}.0x0.0x0"),
        OCCP_SPACE_SIZE * 2,
        endpoint_addr,
    );
    dev.init().expect("device init");
    (dev, sim)
}

fn port_config(name: &str, is_provider: bool, buffer_size: u32) -> PortConfig {
    PortConfig {
        name: name.into(),
        is_provider,
        connection: None,
        ocdp_offset: 0,
        interconnect_index: Some(OCDP_WORKER),
        adapter_index: None,
        adapter_config: None,
        n_buffers: 2,
        buffer_size,
    }
}

#[test]
fn descriptor_exchange_establishes_a_push_channel() {
    let (producer_dev, producer_sim) = sim_hdl_device("PCI:0000:02:00.0", 0x1000_0000);
    let (consumer_dev, consumer_sim) = sim_hdl_device("PCI:0000:03:00.0", 0x2000_0000);

    let mut user = Port::new(&producer_dev, &port_config("out", false, 4096)).expect("user port");
    let mut provider =
        Port::new(&consumer_dev, &port_config("in", true, 4096)).expect("provider port");

    // Step 1: the provider announces without committing resources.
    let initial = provider.initial_provider_info().expect("initial provider info");
    assert!(!provider.is_connected());

    // Step 2: the user resolves roles and finalizes its own side.
    let final_user = user.apply_initial_provider_info(&initial).expect("user finalize");
    assert!(user.is_connected());
    assert_eq!(user.descriptors().role, PortRole::ActiveMessage);

    // Step 3: the provider confirms and finalizes; nothing more to say.
    let rest = provider.apply_initial_user_info(&final_user).expect("provider finalize");
    assert!(rest.is_empty());
    assert!(provider.is_connected());
    assert_eq!(provider.descriptors().role, PortRole::ActiveFlowControl);

    // The producer's OCDP was programmed to message into the consumer.
    let psim = producer_sim.lock().expect("sim");
    let pbase = worker_config_offset(OCDP_WORKER);
    assert_eq!(psim.peek32(pbase + ocdp::N_LOCAL_BUFFERS), 2);
    assert_eq!(psim.peek32(pbase + ocdp::LOCAL_BUFFER_SIZE), 4096);
    assert_eq!(psim.peek32(pbase + ocdp::N_REMOTE_BUFFERS), 2);
    assert_eq!(psim.peek32(pbase + ocdp::REMOTE_BUFFER_SIZE), 4096);
    assert_eq!(
        psim.peek32(pbase + ocdp::CONTROL),
        ocdp::control_word(ocdp::direction::PRODUCER, ocdp::role::ACTIVE_MESSAGE)
    );
    // Remote buffer base points into the consumer's endpoint.
    let remote_base = u64::from(psim.peek32(pbase + ocdp::REMOTE_BUFFER_BASE))
        | u64::from(psim.peek32(pbase + ocdp::REMOTE_BUFFER_HI)) << 32;
    assert_eq!(remote_base, 0x2000_0000 + OCCP_SPACE_SIZE);

    // The consumer's OCDP pushes flow control back.
    let csim = consumer_sim.lock().expect("sim");
    let cbase = worker_config_offset(OCDP_WORKER);
    assert_eq!(
        csim.peek32(cbase + ocdp::CONTROL),
        ocdp::control_word(ocdp::direction::CONSUMER, ocdp::role::ACTIVE_FLOWCONTROL)
    );

    // Both data movers were initialized and started.
    for sim in [&psim, &csim] {
        let stat = sim.peek32(worker_control_offset(OCDP_WORKER) + worker::STATUS);
        assert_eq!(worker::status::last_op(stat), Some(ControlOp::Start as u32));
    }
}

#[test]
fn consumer_rejects_larger_remote_buffers() {
    // Producer pushes 8 KiB buffers at a consumer that only has 4 KiB.
    let (producer_dev, _psim) = sim_hdl_device("PCI:0000:02:00.0", 0x1000_0000);
    let (consumer_dev, _csim) = sim_hdl_device("PCI:0000:03:00.0", 0x2000_0000);

    let mut user = Port::new(&producer_dev, &port_config("out", false, 8192)).expect("user port");
    let mut provider =
        Port::new(&consumer_dev, &port_config("in", true, 4096)).expect("provider port");
    // The consumer mandates doing the messaging itself, so the size check
    // runs on the provider side.
    provider.set_transfer_role(PortRole::ActiveMessage, true);
    user.set_transfer_role(PortRole::ActiveFlowControl, false);

    let initial = provider.initial_provider_info().expect("initial provider info");
    let final_user = user.apply_initial_provider_info(&initial).expect("user finalize");
    let err = provider.apply_initial_user_info(&final_user).unwrap_err();
    assert!(
        err.to_string().contains("remote buffer size is larger than mine"),
        "got: {err}"
    );
    assert!(!provider.is_connected());
}

#[test]
fn producer_rejects_smaller_remote_buffers() {
    let (producer_dev, _psim) = sim_hdl_device("PCI:0000:02:00.0", 0x1000_0000);
    let (consumer_dev, _csim) = sim_hdl_device("PCI:0000:03:00.0", 0x2000_0000);

    let mut user = Port::new(&producer_dev, &port_config("out", false, 8192)).expect("user port");
    let mut provider =
        Port::new(&consumer_dev, &port_config("in", true, 4096)).expect("provider port");

    let initial = provider.initial_provider_info().expect("initial provider info");
    let err = user.apply_initial_provider_info(&initial).unwrap_err();
    assert!(
        err.to_string().contains("remote buffer size smaller than mine"),
        "got: {err}"
    );
}

#[test]
fn oversized_geometry_is_caught_before_any_commitment() {
    let (dev, _sim) = sim_hdl_device("PCI:0000:02:00.0", 0x1000_0000);
    let mut cfg = port_config("in", true, 16384);
    cfg.n_buffers = 4; // 4 × (16384 + 16) > 0x8000
    let mut provider = Port::new(&dev, &cfg).expect("port");
    let err = provider.initial_provider_info().unwrap_err();
    assert!(err.to_string().contains("won't fit in the OCDP's memory"), "got: {err}");
}

#[test]
fn colocated_ports_match_by_connection_identity() {
    let (dev, _sim) = sim_hdl_device("PCI:0000:02:00.0", 0x1000_0000);

    let internal = |name: &str, provider: bool, conn: &str| PortConfig {
        name: name.into(),
        is_provider: provider,
        connection: Some(conn.into()),
        ocdp_offset: 0,
        interconnect_index: None,
        adapter_index: None,
        adapter_config: None,
        n_buffers: 2,
        buffer_size: 2048,
    };

    let mut user = Port::new(&dev, &internal("out", false, "conn0")).expect("user");
    let mut provider = Port::new(&dev, &internal("in", true, "conn0")).expect("provider");
    user.connect_inside(&mut provider).expect("same connection element");
    assert!(user.is_connected() && provider.is_connected());

    let mut user = Port::new(&dev, &internal("out", false, "conn0")).expect("user");
    let mut other = Port::new(&dev, &internal("in", true, "conn1")).expect("provider");
    let err = user.connect_inside(&mut other).unwrap_err();
    assert!(err.to_string().contains("not connected"), "got: {err}");
}

#[test]
fn ether_devices_negotiate_push_roles_only() {
    let sim = SimDevice::shared("ml605", "xc6vlx240t");
    sim.lock().expect("sim").install_ocdp(OCDP_WORKER, OCDP_MEMORY);
    let acc: SharedAccessor = sim.clone();
    let mut dev = Device::new(
        "Ether:eth0/02:00:00:00:10:00",
        "ocpi-ether-rdma",
        Access::remote(acc.clone(), 0, 0),
        Access::remote(acc, 0, OCCP_SPACE_SIZE),
        "ocpi-ether-rdma:eth0/02:00:00:00:10:00".into(),
        OCCP_SPACE_SIZE * 2,
        0,
    );
    dev.init().expect("init");
    assert_eq!(dev.dma_options(true), PortRole::ActiveFlowControl.bit());
    assert_eq!(dev.dma_options(false), PortRole::ActiveMessage.bit());
}
