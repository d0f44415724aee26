use crate::{
    Result, VmOpsError,
    config::VmOpsConfig,
    instance::Instance,
    log_debug, log_info, log_warn,
    progress::{LoggingProgress, ProgressReporter},
    resize::ResizeFunc,
    session::{DiskType, PowerState, VmRef, XenSession},
    vm_mode::{self, DiskInfo, DiskRole, VmMode},
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::OnceCell;

pub const XENSTORE_AUTO_DISK_CONFIG: &str = "vm-data/auto-disk-config";
pub const XENSTORE_HOSTNAME: &str = "vm-data/hostname";

/// Windows limits NetBIOS computer names to 15 characters.
const WINDOWS_HOSTNAME_MAX: usize = 15;

/// VM operations bound to one hypervisor session.
pub struct VmOps {
    session: Arc<dyn XenSession>,
    config: VmOpsConfig,
    progress: Arc<dyn ProgressReporter>,
    // Probed once per session; the host setting does not change under it.
    sr_check_relaxed: OnceCell<bool>,
}

impl VmOps {
    pub fn new(session: Arc<dyn XenSession>, config: VmOpsConfig) -> Self {
        Self {
            session,
            config,
            progress: Arc::new(LoggingProgress),
            sr_check_relaxed: OnceCell::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn session(&self) -> &dyn XenSession {
        self.session.as_ref()
    }

    pub fn config(&self) -> &VmOpsConfig {
        &self.config
    }

    pub(crate) fn progress(&self) -> &dyn ProgressReporter {
        self.progress.as_ref()
    }

    pub fn check_resize_func_name(&self) -> ResizeFunc {
        ResizeFunc::for_product(
            self.session.product_brand().as_deref(),
            self.session.product_version(),
        )
    }

    /// Resolve the instance's VM. With `check_rescue`, a `-rescue` VM wins.
    pub async fn get_vm_opaque_ref(
        &self,
        instance: &Instance,
        check_rescue: bool,
    ) -> Result<VmRef> {
        if check_rescue {
            if let Some(vm) = self.session.lookup_vm(&instance.rescue_name_label()).await? {
                return Ok(vm);
            }
        }

        self.session
            .lookup_vm(&instance.name)
            .await?
            .ok_or_else(|| VmOpsError::NotFound(format!("VM for instance '{}'", instance.name)))
    }

    pub async fn get_dom_id(&self, instance: &Instance, check_rescue: bool) -> Result<i64> {
        let vm = self.get_vm_opaque_ref(instance, check_rescue).await?;
        self.get_dom_id_for_ref(&vm).await
    }

    pub async fn get_dom_id_for_ref(&self, vm: &VmRef) -> Result<i64> {
        self.session.dom_id(vm).await
    }

    pub async fn get_console_output(&self, instance: &Instance) -> Result<String> {
        let dom_id = self.get_dom_id(instance, true).await?;
        if dom_id == 0 {
            return Err(VmOpsError::Driver(format!(
                "no console available for instance '{}' (dom_id 0)",
                instance.name
            )));
        }
        Ok(format!("dom_id: {}", dom_id))
    }

    pub async fn inject_auto_disk_config(&self, instance: &Instance, vm: &VmRef) -> Result<()> {
        let value = if instance.auto_disk_config_enabled() {
            "True"
        } else {
            "False"
        };
        self.session
            .write_xenstore(vm, XENSTORE_AUTO_DISK_CONFIG, value)
            .await
    }

    pub async fn inject_hostname(
        &self,
        instance: &Instance,
        vm: &VmRef,
        rescue: bool,
    ) -> Result<()> {
        let Some(hostname) = instance.hostname.as_deref() else {
            log_debug!("Instance '{}' has no hostname to inject", instance.name);
            return Ok(());
        };

        let mut hostname = if rescue {
            format!("RESCUE-{}", hostname)
        } else {
            hostname.to_string()
        };
        if instance.is_windows() {
            hostname = hostname.chars().take(WINDOWS_HOSTNAME_MAX).collect();
        }

        log_debug!("Injecting hostname '{}' into xenstore", hostname);
        self.session
            .write_xenstore(vm, XENSTORE_HOSTNAME, &hostname)
            .await
    }

    pub async fn remove_hostname(&self, instance: &Instance, vm: &VmRef) -> Result<()> {
        log_debug!("Removing hostname from xenstore for '{}'", instance.name);
        self.session.remove_xenstore(vm, XENSTORE_HOSTNAME).await
    }

    pub async fn determine_vm_mode(
        &self,
        instance: &Instance,
        disks: Option<&HashMap<DiskRole, DiskInfo>>,
        disk_type: Option<DiskType>,
    ) -> Result<VmMode> {
        vm_mode::determine_vm_mode(self.session(), instance, disks, disk_type).await
    }

    pub async fn make_plugin_call(
        &self,
        plugin: &str,
        method: &str,
        args: &BTreeMap<String, String>,
    ) -> Result<String> {
        log_debug!("Calling plugin {}.{}", plugin, method);
        self.session.call_plugin(plugin, method, args).await
    }

    /// Whether the host relaxes the XSM storage-repository check, which
    /// volume-backed block migration depends on. One plugin call per session.
    pub async fn is_xsm_sr_check_relaxed(&self) -> Result<bool> {
        self.sr_check_relaxed
            .get_or_try_init(|| async {
                let mut args = BTreeMap::new();
                args.insert("key".to_string(), self.config.plugins.relax_xsm_sr_check_key.clone());
                let value = self
                    .make_plugin_call(&self.config.plugins.config_file, "get_val", &args)
                    .await?;
                Ok::<_, VmOpsError>(value.trim().eq_ignore_ascii_case("true"))
            })
            .await
            .copied()
    }

    pub async fn check_can_block_migrate(
        &self,
        instance: &Instance,
        volume_backed: bool,
    ) -> Result<()> {
        self.get_vm_opaque_ref(instance, false).await?;

        if volume_backed && !self.is_xsm_sr_check_relaxed().await? {
            return Err(VmOpsError::Unsupported(format!(
                "block migration of volume-backed instance '{}' needs the relaxed XSM SR check",
                instance.name
            )));
        }
        Ok(())
    }

    pub(crate) async fn ensure_vm_is_shutdown(
        &self,
        instance: &Instance,
        vm: &VmRef,
    ) -> Result<()> {
        if self.session.power_state(vm).await? == PowerState::Halted {
            log_debug!("VM '{}' already halted, skipping shutdown", instance.name);
            return Ok(());
        }

        log_info!("Shutting down VM '{}'", instance.name);
        let clean = match self.session.clean_shutdown_vm(vm).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        if !self.config.resize.hard_shutdown_fallback {
            return Err(clean);
        }

        log_warn!(
            "Clean shutdown of '{}' failed ({}), attempting hard shutdown",
            instance.name,
            clean
        );
        self.session.hard_shutdown_vm(vm).await.map_err(|err| {
            VmOpsError::Resize(format!(
                "Unable to terminate instance '{}': {}",
                instance.name, err
            ))
        })
    }
}
