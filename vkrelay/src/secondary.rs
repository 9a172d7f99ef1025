//! Off-path creation of the display-adapter logical context.
//!
//! Creating a second logical device is slow, so it runs on its own thread,
//! started right after the application's render device exists, and is only
//! waited for when the first swapchain is created. Cancellation is not
//! supported: once started the task runs to completion.

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::backend::InstanceBackend;
use crate::command_buffer::QUEUE_FAMILY_INDEX;
use crate::device::DisplayContext;
use crate::error::{RelayError, Result};
use crate::topology::AdapterRole;

enum JoinState {
    Running(JoinHandle<Result<DisplayContext>>),
    Finished(Result<Arc<DisplayContext>>),
}

/// Handle to the background display-context creation.
pub struct SecondaryContext {
    state: Mutex<JoinState>,
}

impl SecondaryContext {
    /// Launch `task` on a dedicated thread and return immediately.
    pub fn start<F>(task: F) -> Result<Self>
    where
        F: FnOnce() -> Result<DisplayContext> + Send + 'static,
    {
        let thread = std::thread::Builder::new()
            .name("vkrelay-display-init".to_string())
            .spawn(task)
            .map_err(|e| RelayError::SecondaryContextFailed(e.to_string()))?;
        info!("Display context creation started");
        Ok(Self {
            state: Mutex::new(JoinState::Running(thread)),
        })
    }

    /// Block until the display context is ready. Later calls return the same outcome.
    pub fn join(&self) -> Result<Arc<DisplayContext>> {
        let mut state = self.state.lock();
        let placeholder = JoinState::Finished(Err(RelayError::SecondaryContextFailed(
            "initializer join interrupted".to_string(),
        )));
        let thread = match std::mem::replace(&mut *state, placeholder) {
            JoinState::Running(thread) => thread,
            JoinState::Finished(outcome) => {
                debug!("Refusing second join of the display context initializer");
                *state = JoinState::Finished(outcome.clone());
                return outcome;
            }
        };

        let outcome = match thread.join() {
            Ok(result) => result.map(Arc::new),
            Err(_) => Err(RelayError::SecondaryContextFailed(
                "initializer thread panicked".to_string(),
            )),
        };
        match &outcome {
            Ok(_) => info!("Display context ready"),
            Err(err) => error!("Display context creation failed: {}", err),
        }
        *state = JoinState::Finished(outcome.clone());
        outcome
    }
}

/// Build the display context through `instance`: reveal both adapters,
/// read their memory tables, and open the display adapter with one queue
/// from family 0 and the swapchain extension.
pub fn create_display_context(instance: &dyn InstanceBackend) -> Result<DisplayContext> {
    let adapters = instance.enumerate_adapters()?;
    debug!("Revealed adapters: {:?}", adapters);
    let render = *adapters
        .first()
        .ok_or(RelayError::AdapterNotFound(AdapterRole::Render))?;
    let display = *adapters
        .get(1)
        .ok_or(RelayError::AdapterNotFound(AdapterRole::Display))?;

    let render_info = instance.adapter_info(render)?;
    let display_info = instance.adapter_info(display)?;
    if display_info.queue_families.is_empty() {
        return Err(RelayError::InitializationFailed(format!(
            "display adapter {} exposes no queue families",
            display_info.name
        )));
    }

    info!("Creating display context on {}", display_info.name);
    let opened = instance.create_device(
        display,
        QUEUE_FAMILY_INDEX,
        &[ash::khr::swapchain::NAME],
    )?;

    Ok(DisplayContext {
        backend: opened.backend,
        physical_device: display,
        queue: opened.queue,
        render_memory: render_info.memory,
        display_memory: display_info.memory,
        teardown: opened.teardown,
    })
}

/// Wait for an initializer whose instance is going away and let go of the
/// display context it built. The display device is destroyed here unless a
/// swapchain still holds the context, in which case the last one to go does it.
pub fn release_display_context(secondary: Arc<SecondaryContext>) {
    match secondary.join() {
        // One reference is ours, one is the cached join outcome.
        Ok(display) if Arc::strong_count(&display) > 2 => warn!(
            "Display context on {:?} still in use by live swapchains",
            display.physical_device
        ),
        Ok(_) => debug!("Releasing display context"),
        Err(err) => debug!("Releasing failed display context initializer: {}", err),
    }
}
