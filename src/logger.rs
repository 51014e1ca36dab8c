// Copyright 2024-2025 Tree xie.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::error::Error;
use tracing::Level;

#[derive(Debug, Default)]
pub struct LoggerParams {
    pub level: String,
    pub json: bool,
}

pub fn logger_try_init(params: LoggerParams) -> Result<(), Box<dyn Error>> {
    let level = match params.level.to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" => Level::WARN,
        "debug" => Level::DEBUG,
        _ => Level::INFO,
    };

    let seconds = chrono::Local::now().offset().local_minus_utc();
    let hours = (seconds / 3600) as i8;
    let minutes = ((seconds % 3600) / 60) as i8;
    let is_dev = cfg!(debug_assertions);
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        time::UtcOffset::from_hms(hours, minutes, 0)?,
        time::format_description::well_known::Rfc3339,
    );

    if params.json {
        tracing_subscriber::fmt()
            .event_format(tracing_subscriber::fmt::format::json())
            .with_max_level(level)
            .with_ansi(is_dev)
            .with_timer(timer)
            .with_target(is_dev)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(is_dev)
            .with_timer(timer)
            .with_target(is_dev)
            .init();
    }

    Ok(())
}
