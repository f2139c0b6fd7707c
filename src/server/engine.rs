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

//! The engine: one render thread, paced to the refresh interval. Startup is
//! handshaked so callers see a renderer that is already online when
//! `start` returns.

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use crate::prelude::*;
use crate::server::events::EventRouter;
use crate::server::manager::WindowManager;
use crate::server::renderer::Renderer;
use crate::utils;

pub struct Engine {
    running: Arc<AtomicBool>,
    renderer: Arc<Renderer>,
    thread: Option<JoinHandle<()>>,
}

impl Engine {
    /// Spawns the render thread and blocks until it has completed its
    /// startup (first-frame state initialized, renderer marked online).
    pub fn start(
        renderer: Arc<Renderer>,
        manager: Arc<WindowManager>,
        events: Arc<EventRouter>,
        refresh: Duration,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let started = Arc::new((Mutex::new(false), Condvar::new()));

        let thread = {
            let running = running.clone();
            let renderer = renderer.clone();
            let started = started.clone();
            std::thread::Builder::new()
                .name("prism-render".to_string())
                .spawn(move || {
                    renderer.set_online(true);
                    {
                        let (lock, signal) = &*started;
                        *lock.lock().unwrap() = true;
                        signal.notify_one();
                    }

                    render_loop(&renderer, &manager, &events, &running, refresh);
                    renderer.set_online(false);
                })
                .location(loc!())?
        };

        let (lock, signal) = &*started;
        let mut ready = lock.lock().unwrap();
        while !*ready {
            ready = signal.wait(ready).unwrap();
        }

        info!(
            "render thread started, pacing to {} ms",
            refresh.as_millis()
        );
        Ok(Self {
            running,
            renderer,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.renderer.set_online(false);
        if let Some(thread) = self.thread.take() {
            utils::join_unwrap(thread);
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn render_loop(
    renderer: &Renderer,
    manager: &WindowManager,
    events: &EventRouter,
    running: &AtomicBool,
    refresh: Duration,
) {
    let refresh_ms = refresh.as_millis().max(1) as u64;
    let mut last_update = Instant::now();

    while running.load(Ordering::Acquire) {
        renderer.render(manager, events);

        let elapsed_ms = last_update.elapsed().as_millis() as u64;
        let pace = refresh_ms.saturating_sub(elapsed_ms % refresh_ms);
        if pace > 0 {
            std::thread::sleep(Duration::from_millis(pace));
        }
        last_update = Instant::now();
    }
}
