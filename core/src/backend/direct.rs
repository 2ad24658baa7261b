// Copyright 2025 HEM Sp. z o.o.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use log::{debug, info};

use crate::backend::DeviceBackend;
use crate::definitions::{BackendKind, LedColor, Rgb};
use crate::errors::BackendError;

/// Synchronous contract of a locally attached LED controller.
///
/// Every call returns whether the device accepted it; the transport behind it is opaque.
pub trait LedDevice: Send {
    fn open(&mut self) -> bool;
    fn close(&mut self);
    fn count_leds(&self) -> usize;
    fn set_color(&mut self, index: usize, color: Rgb) -> bool;
    fn set_color_to_all(&mut self, color: Rgb) -> bool;
    fn set_colors(&mut self, colors: &[LedColor]) -> bool;
    fn set_brightness(&mut self, value: u8) -> bool;
    fn set_gamma(&mut self, value: f64) -> bool;
    fn set_smooth(&mut self, value: u8) -> bool;
    fn turn_on(&mut self) -> bool;
    fn turn_off(&mut self) -> bool;
}

struct DirectState<D> {
    device: D,
    open: bool,
}

/// Backend driving a [`LedDevice`] in-process. Calls complete synchronously, so no
/// queue is involved.
pub struct DirectBackend<D: LedDevice> {
    state: Mutex<DirectState<D>>,
}

impl<D: LedDevice> DirectBackend<D> {
    pub fn new(device: D) -> Self {
        Self { state: Mutex::new(DirectState { device, open: false }) }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).open
    }

    fn with_device<F>(&self, op: F) -> Result<(), BackendError>
    where
        F: FnOnce(&mut D) -> bool,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.open {
            return Err(BackendError::NotConnected);
        }
        if op(&mut state.device) {
            Ok(())
        } else {
            Err(BackendError::Rejected)
        }
    }
}

#[async_trait]
impl<D: LedDevice + 'static> DeviceBackend for DirectBackend<D> {
    fn kind(&self) -> BackendKind {
        BackendKind::Direct
    }

    fn is_connected(&self) -> bool {
        self.is_open()
    }

    async fn connect(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.open {
            return Ok(());
        }
        if !state.device.open() {
            debug!("Direct device could not be opened");
            return Err(BackendError::Unavailable);
        }
        state.open = true;
        info!("Direct device opened");
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.open {
            state.device.close();
            state.open = false;
            info!("Direct device closed");
        }
    }

    async fn led_count(&self) -> Result<usize, BackendError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.open {
            return Err(BackendError::NotConnected);
        }
        Ok(state.device.count_leds())
    }

    async fn set_color(&self, index: usize, color: Rgb) -> Result<(), BackendError> {
        self.with_device(|device| device.set_color(index, color))
    }

    async fn set_color_to_all(&self, color: Rgb) -> Result<(), BackendError> {
        self.with_device(|device| device.set_color_to_all(color))
    }

    async fn set_colors(&self, colors: &[LedColor]) -> Result<(), BackendError> {
        self.with_device(|device| device.set_colors(colors))
    }

    async fn set_brightness(&self, value: u8) -> Result<(), BackendError> {
        self.with_device(|device| device.set_brightness(value))
    }

    async fn set_gamma(&self, value: f64) -> Result<(), BackendError> {
        self.with_device(|device| device.set_gamma(value))
    }

    async fn set_smooth(&self, value: u8) -> Result<(), BackendError> {
        self.with_device(|device| device.set_smooth(value))
    }

    async fn turn_on(&self) -> Result<(), BackendError> {
        self.with_device(|device| device.turn_on())
    }

    async fn turn_off(&self) -> Result<(), BackendError> {
        self.with_device(|device| device.turn_off())
    }
}
