// Copyright (c) The kirk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::Parser;
use kirk::App;

fn main() {
    let app = App::parse();
    std::process::exit(app.exec());
}
