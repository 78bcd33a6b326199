// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

fn main() {
    let out_dir = std::env::var("OUT_DIR").unwrap();
    let dst = std::path::Path::new(&out_dir).join("built.rs");
    built::write_built_file_with_opts(None, std::path::Path::new(env!("CARGO_MANIFEST_DIR")), &dst)
        .expect("failed to acquire build-time information");
}
