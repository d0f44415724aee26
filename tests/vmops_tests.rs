// Integration tests for VM lookups, xenstore helpers and host capabilities
use nova_vmops::fake::{Call, FailPoint, FakeSession};
use nova_vmops::session::{DiskRef, PowerState, ProductVersion};
use nova_vmops::vm_mode::{DiskInfo, DiskRole};
use nova_vmops::vmops::{XENSTORE_AUTO_DISK_CONFIG, XENSTORE_HOSTNAME};
use nova_vmops::*;
use std::collections::HashMap;
use std::sync::Arc;

fn setup() -> (Arc<FakeSession>, VmOps) {
    let session = Arc::new(FakeSession::new());
    let vmops = VmOps::new(session.clone(), VmOpsConfig::default());
    (session, vmops)
}

fn probe_count(session: &FakeSession) -> usize {
    session
        .calls()
        .iter()
        .filter(|call| matches!(call, Call::ProbeIsPv { .. }))
        .count()
}

#[tokio::test]
async fn test_get_dom_id_prefers_rescue_vm() {
    let (session, vmops) = setup();
    let vm = session.create_vm("inst", PowerState::Running);
    let rescue = session.create_vm("inst-rescue", PowerState::Running);
    session.set_dom_id(&vm, 3).unwrap();
    session.set_dom_id(&rescue, 7).unwrap();
    let instance = Instance::new("inst", 10, 0);

    assert_eq!(vmops.get_dom_id(&instance, true).await.unwrap(), 7);
    assert_eq!(vmops.get_dom_id(&instance, false).await.unwrap(), 3);
    assert_eq!(vmops.get_dom_id_for_ref(&rescue).await.unwrap(), 7);
}

#[tokio::test]
async fn test_get_dom_id_falls_back_without_rescue_vm() {
    let (session, vmops) = setup();
    let vm = session.create_vm("inst", PowerState::Running);
    session.set_dom_id(&vm, 12).unwrap();
    let instance = Instance::new("inst", 10, 0);

    assert_eq!(vmops.get_dom_id(&instance, true).await.unwrap(), 12);
    assert_eq!(vmops.get_vm_opaque_ref(&instance, true).await.unwrap(), vm);
}

#[tokio::test]
async fn test_get_dom_id_for_missing_instance() {
    let (_session, vmops) = setup();
    let instance = Instance::new("ghost", 10, 0);

    let err = vmops.get_dom_id(&instance, true).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_console_output_reports_dom_id() {
    let (session, vmops) = setup();
    let vm = session.create_vm("inst", PowerState::Running);
    session.set_dom_id(&vm, 42).unwrap();
    let instance = Instance::new("inst", 10, 0);

    assert_eq!(vmops.get_console_output(&instance).await.unwrap(), "dom_id: 42");
}

#[tokio::test]
async fn test_console_output_rejects_control_domain() {
    let (session, vmops) = setup();
    let vm = session.create_vm("inst", PowerState::Running);
    session.set_dom_id(&vm, 0).unwrap();
    let instance = Instance::new("inst", 10, 0);

    let err = vmops.get_console_output(&instance).await.unwrap_err();
    assert!(matches!(err, VmOpsError::Driver(_)));
}

#[tokio::test]
async fn test_console_output_uses_rescue_vm() {
    let (session, vmops) = setup();
    let vm = session.create_vm("inst", PowerState::Running);
    let rescue = session.create_vm("inst-rescue", PowerState::Running);
    session.set_dom_id(&vm, 0).unwrap();
    session.set_dom_id(&rescue, 9).unwrap();
    let instance = Instance::new("inst", 10, 0);

    assert_eq!(vmops.get_console_output(&instance).await.unwrap(), "dom_id: 9");
}

#[tokio::test]
async fn test_inject_auto_disk_config() {
    let (session, vmops) = setup();
    let vm = session.create_vm("inst", PowerState::Running);
    let mut instance = Instance::new("inst", 10, 0);

    vmops.inject_auto_disk_config(&instance, &vm).await.unwrap();
    assert_eq!(
        session.xenstore(&vm).get(XENSTORE_AUTO_DISK_CONFIG).map(String::as_str),
        Some("False")
    );

    instance.auto_disk_config = Some(true);
    vmops.inject_auto_disk_config(&instance, &vm).await.unwrap();
    assert_eq!(
        session.xenstore(&vm).get(XENSTORE_AUTO_DISK_CONFIG).map(String::as_str),
        Some("True")
    );
}

#[tokio::test]
async fn test_inject_and_remove_hostname() {
    let (session, vmops) = setup();
    let vm = session.create_vm("inst", PowerState::Running);
    let mut instance = Instance::new("inst", 10, 0);
    instance.hostname = Some("web-frontend".to_string());

    vmops.inject_hostname(&instance, &vm, false).await.unwrap();
    assert_eq!(
        session.xenstore(&vm).get(XENSTORE_HOSTNAME).map(String::as_str),
        Some("web-frontend")
    );

    vmops.inject_hostname(&instance, &vm, true).await.unwrap();
    assert_eq!(
        session.xenstore(&vm).get(XENSTORE_HOSTNAME).map(String::as_str),
        Some("RESCUE-web-frontend")
    );

    vmops.remove_hostname(&instance, &vm).await.unwrap();
    assert!(!session.xenstore(&vm).contains_key(XENSTORE_HOSTNAME));
}

#[tokio::test]
async fn test_windows_hostname_is_truncated() {
    let (session, vmops) = setup();
    let vm = session.create_vm("inst", PowerState::Running);
    let mut instance = Instance::new("inst", 10, 0);
    instance.os_type = Some("windows".to_string());
    instance.hostname = Some("accounting-server-01".to_string());

    vmops.inject_hostname(&instance, &vm, true).await.unwrap();
    assert_eq!(
        session.xenstore(&vm).get(XENSTORE_HOSTNAME).map(String::as_str),
        Some("RESCUE-accounti")
    );
}

#[tokio::test]
async fn test_missing_hostname_writes_nothing() {
    let (session, vmops) = setup();
    let vm = session.create_vm("inst", PowerState::Running);
    let instance = Instance::new("inst", 10, 0);

    vmops.inject_hostname(&instance, &vm, false).await.unwrap();
    assert!(session.calls().is_empty());
}

#[tokio::test]
async fn test_vm_mode_from_metadata_skips_probe() {
    let (session, vmops) = setup();
    let mut instance = Instance::new("inst", 10, 0);
    instance.vm_mode = Some("hvm".to_string());
    let mut disks = HashMap::new();
    disks.insert(DiskRole::Root, DiskInfo::new("root-disk"));

    let mode = vmops
        .determine_vm_mode(&instance, Some(&disks), None)
        .await
        .unwrap();

    assert_eq!(mode, VmMode::Hvm);
    assert_eq!(probe_count(&session), 0);
}

#[tokio::test]
async fn test_vm_mode_without_root_disk_is_hvm() {
    let (session, vmops) = setup();
    let instance = Instance::new("inst", 10, 0);

    assert_eq!(
        vmops.determine_vm_mode(&instance, None, None).await.unwrap(),
        VmMode::Hvm
    );

    let mut disks = HashMap::new();
    disks.insert(DiskRole::Iso, DiskInfo::new("iso-disk"));
    assert_eq!(
        vmops
            .determine_vm_mode(&instance, Some(&disks), None)
            .await
            .unwrap(),
        VmMode::Hvm
    );
    assert_eq!(probe_count(&session), 0);
}

#[tokio::test]
async fn test_vm_mode_probes_root_disk_once() {
    let (session, vmops) = setup();
    let instance = Instance::new("inst", 10, 0);
    session.mark_pv(&DiskRef::from("pv-root"));

    let mut disks = HashMap::new();
    disks.insert(DiskRole::Root, DiskInfo::new("pv-root"));
    let mode = vmops
        .determine_vm_mode(&instance, Some(&disks), None)
        .await
        .unwrap();
    assert_eq!(mode, VmMode::Xen);
    assert_eq!(probe_count(&session), 1);

    session.clear_calls();
    disks.insert(DiskRole::Root, DiskInfo::new("hvm-root"));
    let mode = vmops
        .determine_vm_mode(&instance, Some(&disks), None)
        .await
        .unwrap();
    assert_eq!(mode, VmMode::Hvm);
    assert_eq!(probe_count(&session), 1);
}

#[tokio::test]
async fn test_vm_mode_rejects_unknown_metadata() {
    let (_session, vmops) = setup();
    let mut instance = Instance::new("inst", 10, 0);
    instance.vm_mode = Some("qemu".to_string());

    let err = vmops.determine_vm_mode(&instance, None, None).await.unwrap_err();
    assert!(matches!(err, VmOpsError::InvalidVmMode(_)));
}

#[tokio::test]
async fn test_xsm_sr_check_is_queried_once_per_session() {
    let (session, vmops) = setup();
    session.set_plugin_response("config_file", "get_val", "true");

    assert!(vmops.is_xsm_sr_check_relaxed().await.unwrap());
    assert!(vmops.is_xsm_sr_check_relaxed().await.unwrap());
    assert_eq!(session.plugin_call_count(), 1);
}

#[tokio::test]
async fn test_xsm_sr_check_failure_is_not_cached() {
    let (session, vmops) = setup();
    session.set_plugin_response("config_file", "get_val", "false");
    session.fail(FailPoint::Plugin);

    assert!(vmops.is_xsm_sr_check_relaxed().await.is_err());

    session.clear_failures();
    assert!(!vmops.is_xsm_sr_check_relaxed().await.unwrap());
    assert_eq!(session.plugin_call_count(), 2);
}

#[tokio::test]
async fn test_block_migrate_needs_relaxed_check_for_volumes() {
    let (session, vmops) = setup();
    session.create_vm("inst", PowerState::Running);
    session.set_plugin_response("config_file", "get_val", "false");
    let instance = Instance::new("inst", 10, 0);

    vmops.check_can_block_migrate(&instance, false).await.unwrap();
    assert_eq!(session.plugin_call_count(), 0);

    let err = vmops
        .check_can_block_migrate(&instance, true)
        .await
        .unwrap_err();
    assert!(matches!(err, VmOpsError::Unsupported(_)));
}

#[tokio::test]
async fn test_block_migrate_of_missing_instance() {
    let (_session, vmops) = setup();
    let err = vmops
        .check_can_block_migrate(&Instance::new("ghost", 10, 0), false)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_resize_func_depends_on_host_product() {
    let old_xcp = FakeSession::new().with_product("XCP", ProductVersion(1, 1, 0));
    let vmops = VmOps::new(Arc::new(old_xcp), VmOpsConfig::default());
    assert_eq!(vmops.check_resize_func_name(), ResizeFunc::ResizeOnline);

    let xenserver = FakeSession::new().with_product("XenServer", ProductVersion(6, 2, 0));
    let vmops = VmOps::new(Arc::new(xenserver), VmOpsConfig::default());
    assert_eq!(vmops.check_resize_func_name(), ResizeFunc::Resize);

    let (_session, vmops) = setup();
    assert_eq!(vmops.check_resize_func_name(), ResizeFunc::Resize);
}
