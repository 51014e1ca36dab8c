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

use snafu::Snafu;

/// Error enum for the certificate and supervision modules.
///
/// Note that an unparseable certificate expiry is not represented here:
/// a certificate whose validity cannot be read is simply renewed.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unsupported mode {mode}"))]
    UnsupportedMode { mode: String },
    #[snafu(display("Missing certificate input files: {}", files.join(", ")))]
    MissingInput { files: Vec<String> },
    #[snafu(display("Fail to spawn {command}, {source}"))]
    CommandSpawn {
        command: String,
        source: std::io::Error,
    },
    #[snafu(display("{command} exited with code {code}"))]
    CommandFailed { command: String, code: i32 },
    #[snafu(display("{command} timed out after {seconds}s"))]
    CommandTimeout { command: String, seconds: u64 },
    #[snafu(display("Io error {source}, {path}"))]
    Io {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Fail to launch proxy, {source}"))]
    ProxyLaunch { source: std::io::Error },
    #[snafu(display("Proxy exited unexpectedly, {status}"))]
    ProxyExited { status: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
