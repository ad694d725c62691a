//! Input devices through libinput.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use anyhow::{anyhow, bail, Context};
use smithay::backend::input::InputEvent;
use smithay::backend::libinput::{LibinputInputBackend, LibinputSessionInterface};
use smithay::reexports::calloop::LoopHandle;
use smithay::reexports::input::event::{DeviceEvent, EventTrait};
use smithay::reexports::input::{self, DeviceCapability, Libinput};

use super::{
    Backend, BackendEvents, BackendId, DeviceSession, InputCapabilities, InputDevice, SeatSession,
};
use crate::buffer::BufferCaps;
use crate::config::ENV_LIBINPUT_NO_DEVICES;
use crate::utils::Signal;

type InsertSource = Box<dyn FnOnce(Weak<Inner>, Libinput) -> anyhow::Result<Box<dyn FnOnce()>>>;

struct Inner {
    id: BackendId,
    events: BackendEvents,
    input_events: Signal<InputEvent<LibinputInputBackend>>,
    libinput: RefCell<Libinput>,
    devices: RefCell<Vec<(input::Device, InputDevice)>>,
    allow_no_devices: bool,
    started: Cell<bool>,
    destroyed: Cell<bool>,
    insert_source: RefCell<Option<InsertSource>>,
    remove_source: RefCell<Option<Box<dyn FnOnce()>>>,
}

/// Backend providing the input devices of the seat.
#[derive(Clone)]
pub struct LibinputBackend {
    inner: Rc<Inner>,
}

impl LibinputBackend {
    pub fn new<D: 'static>(
        session: &SeatSession,
        handle: &LoopHandle<'static, D>,
        allow_no_devices: bool,
    ) -> anyhow::Result<Self> {
        let _span = tracy_client::span!("LibinputBackend::new");

        let mut libinput =
            Libinput::new_with_udev(LibinputSessionInterface::from(session.libseat()));
        libinput
            .udev_assign_seat(&session.seat())
            .map_err(|()| anyhow!("error assigning the seat to libinput"))?;

        let handle = handle.clone();
        let insert_source: InsertSource = Box::new(move |weak, libinput| {
            let input_backend = LibinputInputBackend::new(libinput);
            let token = handle
                .insert_source(input_backend, move |event, _, _| {
                    if let Some(inner) = weak.upgrade() {
                        on_input_event(&inner, event);
                    }
                })
                .map_err(|err| anyhow!("error inserting the libinput source: {}", err.error))?;
            Ok(Box::new(move || handle.remove(token)) as Box<dyn FnOnce()>)
        });

        Ok(Self {
            inner: Rc::new(Inner {
                id: BackendId::next(),
                events: BackendEvents::new(),
                input_events: Signal::new(),
                libinput: RefCell::new(libinput),
                devices: RefCell::new(Vec::new()),
                allow_no_devices,
                started: Cell::new(false),
                destroyed: Cell::new(false),
                insert_source: RefCell::new(Some(insert_source)),
                remove_source: RefCell::new(None),
            }),
        })
    }

    /// Every input event after device addition and removal have been handled.
    pub fn input_events(&self) -> &Signal<InputEvent<LibinputInputBackend>> {
        &self.inner.input_events
    }

    pub fn devices(&self) -> Vec<InputDevice> {
        self.inner
            .devices
            .borrow()
            .iter()
            .map(|(_, device)| device.clone())
            .collect()
    }
}

fn make_input_device(device: &input::Device) -> InputDevice {
    let capabilities = InputCapabilities {
        keyboard: device.has_capability(DeviceCapability::Keyboard),
        pointer: device.has_capability(DeviceCapability::Pointer),
        touch: device.has_capability(DeviceCapability::Touch),
        tablet_tool: device.has_capability(DeviceCapability::TabletTool),
        tablet_pad: device.has_capability(DeviceCapability::TabletPad),
        switch: device.has_capability(DeviceCapability::Switch),
        gesture: device.has_capability(DeviceCapability::Gesture),
    };
    InputDevice::new(
        device.name().to_owned(),
        device.sysname().to_owned(),
        device.id_vendor(),
        device.id_product(),
        capabilities,
    )
}

fn add_device(inner: &Inner, device: input::Device) {
    if inner.devices.borrow().iter().any(|(d, _)| *d == device) {
        return;
    }

    let input_device = make_input_device(&device);
    debug!("new input device: {}", input_device.name());
    inner
        .devices
        .borrow_mut()
        .push((device, input_device.clone()));

    if inner.started.get() {
        inner.events.new_input.emit(&input_device);
    }
}

fn remove_device(inner: &Inner, device: &input::Device) {
    let removed = {
        let mut devices = inner.devices.borrow_mut();
        devices
            .iter()
            .position(|(d, _)| d == device)
            .map(|idx| devices.remove(idx))
    };

    if let Some((_, input_device)) = removed {
        debug!("input device removed: {}", input_device.name());
        input_device.destroy();
    }
}

fn on_input_event(inner: &Inner, event: InputEvent<LibinputInputBackend>) {
    match &event {
        InputEvent::DeviceAdded { device } => add_device(inner, device.clone()),
        InputEvent::DeviceRemoved { device } => remove_device(inner, device),
        _ => (),
    }
    inner.input_events.emit(&event);
}

impl Backend for LibinputBackend {
    fn id(&self) -> BackendId {
        self.inner.id
    }

    fn name(&self) -> &str {
        "libinput"
    }

    fn start(&self) -> anyhow::Result<()> {
        let _span = tracy_client::span!("LibinputBackend::start");

        if self.inner.started.get() || self.inner.destroyed.get() {
            return Ok(());
        }

        let added = {
            let mut libinput = self.inner.libinput.borrow_mut();
            libinput
                .dispatch()
                .context("error dispatching libinput events")?;

            let mut added = Vec::new();
            for event in &mut *libinput {
                if let input::Event::Device(DeviceEvent::Added(event)) = event {
                    added.push(event.device());
                }
            }
            added
        };

        if added.is_empty() {
            if self.inner.allow_no_devices {
                warn!("libinput found no input devices, continuing anyway");
            } else {
                bail!(
                    "libinput found no input devices; set {ENV_LIBINPUT_NO_DEVICES}=1 to \
                     start without them"
                );
            }
        }

        for device in added {
            add_device(&self.inner, device);
        }

        let insert_source = self
            .inner
            .insert_source
            .borrow_mut()
            .take()
            .context("libinput source already inserted")?;
        let libinput = self.inner.libinput.borrow().clone();
        let remove = insert_source(Rc::downgrade(&self.inner), libinput)?;
        *self.inner.remove_source.borrow_mut() = Some(remove);

        self.inner.started.set(true);
        for device in self.devices() {
            self.inner.events.new_input.emit(&device);
        }
        Ok(())
    }

    fn destroy(&self) {
        if self.inner.destroyed.replace(true) {
            return;
        }

        self.inner.events.destroy.emit(&());

        if let Some(remove) = self.inner.remove_source.borrow_mut().take() {
            remove();
        }
        self.inner.insert_source.borrow_mut().take();

        let devices = std::mem::take(&mut *self.inner.devices.borrow_mut());
        for (_, device) in devices {
            device.destroy();
        }

        self.inner.input_events.clear();
        self.inner.events.clear();
    }

    fn buffer_caps(&self) -> BufferCaps {
        BufferCaps::empty()
    }

    fn events(&self) -> &BackendEvents {
        &self.inner.events
    }
}
