//! Process-wide registry of everything the layer tracks.
//!
//! One lock guards every table: instance and device dispatch, the adapter
//! pairing index, the secondary context initializer and the shadow swapchain
//! handle table. Lookups clone an `Arc`
//! out and release the lock; nothing waits on the GPU or on the initializer
//! thread while holding it.

use ash::vk::{self, Handle};
use log::{debug, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::RelayConfig;
use crate::device::{DeviceContext, DisplayContext};
use crate::error::{RelayError, Result};
use crate::handle::{DispatchKey, HandleTable};
use crate::instance::InstanceDispatch;
use crate::secondary::SecondaryContext;
use crate::swapchain::ShadowSwapchain;

#[derive(Default)]
struct RegistryState {
    instances: FxHashMap<DispatchKey, Arc<InstanceDispatch>>,
    devices: FxHashMap<DispatchKey, Arc<DeviceContext>>,
    adapter_instances: FxHashMap<vk::PhysicalDevice, DispatchKey>,
    render_to_display: FxHashMap<vk::PhysicalDevice, vk::PhysicalDevice>,
    /// The one display initializer, with the instance that owns it.
    secondary: Option<(DispatchKey, Arc<SecondaryContext>)>,
    swapchains: HandleTable<ShadowSwapchain>,
}

pub struct Registry {
    config: RelayConfig,
    reveal_all: AtomicBool,
    state: Mutex<RegistryState>,
}

/// While alive, adapter enumeration through the layer also lists the display adapter.
pub struct RevealGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RevealGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl Registry {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            reveal_all: AtomicBool::new(false),
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    // Instances and the adapter pairing

    pub fn register_instance(&self, key: DispatchKey, dispatch: Arc<InstanceDispatch>) {
        let mut state = self.state.lock();
        for adapter in &dispatch.adapters {
            state.adapter_instances.insert(*adapter, key);
        }
        let pairing = dispatch.pairing;
        state.render_to_display.insert(pairing.render, pairing.display);
        debug!("{:?} --> {:?}", pairing.render, pairing.display);
        state.instances.insert(key, dispatch);
    }

    pub fn remove_instance(&self, key: DispatchKey) -> Option<Arc<InstanceDispatch>> {
        let mut state = self.state.lock();
        let dispatch = state.instances.remove(&key)?;
        state.adapter_instances.retain(|_, owner| *owner != key);
        state.render_to_display.remove(&dispatch.pairing.render);
        Some(dispatch)
    }

    pub fn instance(&self, key: DispatchKey) -> Result<Arc<InstanceDispatch>> {
        self.state
            .lock()
            .instances
            .get(&key)
            .cloned()
            .ok_or_else(|| RelayError::InvalidHandle(format!("untracked instance {:?}", key)))
    }

    pub fn instance_for_adapter(&self, adapter: vk::PhysicalDevice) -> Result<Arc<InstanceDispatch>> {
        let state = self.state.lock();
        state
            .adapter_instances
            .get(&adapter)
            .and_then(|key| state.instances.get(key))
            .cloned()
            .ok_or_else(|| RelayError::InvalidHandle(format!("untracked adapter {:?}", adapter)))
    }

    /// Display adapter bound to `render`, if `render` is a paired render adapter.
    pub fn display_for(&self, render: vk::PhysicalDevice) -> Option<vk::PhysicalDevice> {
        self.state.lock().render_to_display.get(&render).copied()
    }

    pub fn reveal_all(&self) -> RevealGuard<'_> {
        self.reveal_all.store(true, Ordering::SeqCst);
        RevealGuard {
            flag: &self.reveal_all,
        }
    }

    pub fn is_revealing(&self) -> bool {
        self.reveal_all.load(Ordering::SeqCst)
    }

    // Logical contexts

    pub fn register_device(&self, key: DispatchKey, context: Arc<DeviceContext>) {
        self.state.lock().devices.insert(key, context);
    }

    pub fn remove_device(&self, key: DispatchKey) -> Option<Arc<DeviceContext>> {
        self.state.lock().devices.remove(&key)
    }

    pub fn device(&self, key: DispatchKey) -> Result<Arc<DeviceContext>> {
        self.state
            .lock()
            .devices
            .get(&key)
            .cloned()
            .ok_or_else(|| RelayError::InvalidHandle(format!("untracked device {:?}", key)))
    }

    // Secondary context initializer

    /// Start the display context initializer for `owner` unless one already exists.
    ///
    /// Returns `None` when an earlier call already started it. Only one
    /// initializer lives at a time; a new one can start once its owning
    /// instance has been destroyed.
    pub fn begin_secondary_context<F>(
        &self,
        owner: DispatchKey,
        task: F,
    ) -> Result<Option<Arc<SecondaryContext>>>
    where
        F: FnOnce() -> Result<DisplayContext> + Send + 'static,
    {
        let mut state = self.state.lock();
        match &state.secondary {
            Some((current, _)) if *current == owner => {
                debug!("Display context initializer already running");
                return Ok(None);
            }
            Some((current, _)) => {
                warn!(
                    "Display context already owned by instance {:?}; {:?} gets none",
                    current, owner
                );
                return Ok(None);
            }
            None => {}
        }
        let secondary = Arc::new(SecondaryContext::start(task)?);
        state.secondary = Some((owner, secondary.clone()));
        Ok(Some(secondary))
    }

    /// Wait for the display context of `owner`; the registry lock is not held while waiting.
    pub fn join_secondary_context(&self, owner: DispatchKey) -> Result<Arc<DisplayContext>> {
        let secondary = match &self.state.lock().secondary {
            Some((current, secondary)) if *current == owner => secondary.clone(),
            _ => return Err(RelayError::SecondaryContextMissing),
        };
        secondary.join()
    }

    /// Detach the initializer owned by `owner`, so the next instance can start its own.
    pub fn take_secondary_context(&self, owner: DispatchKey) -> Option<Arc<SecondaryContext>> {
        let mut state = self.state.lock();
        let owned = matches!(&state.secondary, Some((current, _)) if *current == owner);
        if owned {
            state.secondary.take().map(|(_, secondary)| secondary)
        } else {
            None
        }
    }

    // Shadow swapchains

    pub fn insert_swapchain(&self, swapchain: Arc<ShadowSwapchain>) -> vk::SwapchainKHR {
        let raw = self.state.lock().swapchains.insert(swapchain);
        vk::SwapchainKHR::from_raw(raw)
    }

    pub fn swapchain(&self, handle: vk::SwapchainKHR) -> Result<Arc<ShadowSwapchain>> {
        self.state
            .lock()
            .swapchains
            .get(handle.as_raw())
            .ok_or_else(|| RelayError::InvalidHandle(format!("untracked swapchain {:?}", handle)))
    }

    pub fn remove_swapchain(&self, handle: vk::SwapchainKHR) -> Result<Arc<ShadowSwapchain>> {
        self.state
            .lock()
            .swapchains
            .remove(handle.as_raw())
            .ok_or_else(|| RelayError::InvalidHandle(format!("untracked swapchain {:?}", handle)))
    }

    pub fn swapchain_count(&self) -> usize {
        self.state.lock().swapchains.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}
