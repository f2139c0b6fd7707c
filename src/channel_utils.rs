// Copyright 2025 Google LLC
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

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

pub trait Sender: Clone {
    type T;
    type E;
    fn send(&self, msg: Self::T) -> Result<(), Self::E>;
}

impl<T> Sender for crossbeam_channel::Sender<T> {
    type T = T;
    type E = crossbeam_channel::SendError<T>;
    fn send(&self, msg: Self::T) -> Result<(), Self::E> {
        Self::send(self, msg)
    }
}

/// A sender gated on a flag shared with the connection that drains the other
/// end. Once the peer is gone, sends become no-ops instead of errors.
pub struct DiscardingSender<S: Sender> {
    pub sender: S,
    pub actually_send: Arc<AtomicBool>,
}

impl<S: Sender + Clone> Clone for DiscardingSender<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            actually_send: self.actually_send.clone(),
        }
    }
}

impl<S: Sender> DiscardingSender<S> {
    pub fn send(&self, t: S::T) -> Result<(), S::E> {
        if self.actually_send.load(Ordering::Acquire) {
            self.sender.send(t)
        } else {
            Ok(())
        }
    }
}
