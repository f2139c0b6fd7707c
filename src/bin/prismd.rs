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

use std::fs;
use std::time::Duration;

use calloop::EventLoop;
use calloop::channel;
use prism::args;
use prism::prelude::*;
use prism::protocol::transport;
use prism::protocol::transport::Endpoint;
use prism::region::Region;
use prism::server::Compositor;
use prism::server::backend::NullOutput;
use prism::server::backend::software::SoftwareDriver;
use prism::server::engine::Engine;
use prism::server::memory::ShmSource;
use prism::utils;

pub fn main() -> Result<()> {
    let config = args::init_config().location(loc!())?;
    utils::configure_tracing(
        config.stderr_log_level.0,
        config.log_file.clone(),
        config.file_log_level.0,
    )
    .location(loc!())?;
    utils::exit_on_thread_panic();

    let endpoint: Endpoint = config.endpoint.parse().location(loc!())?;
    if let Endpoint::Unix { path } = &endpoint {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).location(loc!())?;
        }
    }

    let screen = Region::with_size(config.screen_width, config.screen_height);
    let driver = SoftwareDriver::new(screen.width, screen.height, Box::new(NullOutput));
    let mut compositor = Compositor::new(
        Box::new(driver),
        Box::new(ShmSource),
        screen,
        config.framerate as i32,
    );
    compositor.register_default_devices();

    let (dispatch_tx, dispatch_rx) = channel::channel();
    transport::spawn_listener(endpoint, dispatch_tx).location(loc!())?;

    let _engine = Engine::start(
        compositor.renderer(),
        compositor.manager(),
        compositor.events(),
        Duration::from_secs_f64(1.0 / f64::from(config.framerate.max(1))),
    )
    .location(loc!())?;

    let mut event_loop: EventLoop<Compositor> = EventLoop::try_new().location(loc!())?;
    event_loop
        .handle()
        .insert_source(dispatch_rx, |event, _metadata, compositor| match event {
            channel::Event::Msg(message) => compositor.handle_message(message),
            channel::Event::Closed => {
                unreachable!(
                    "the transport keeps a sender alive for the lifetime of the process"
                )
            },
        })
        .map_err(|e| anyhow!("{e}"))
        .location(loc!())?;

    event_loop
        .run(None, &mut compositor, |_| {})
        .location(loc!())?;
    Ok(())
}
