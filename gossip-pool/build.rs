// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::io::Result;

fn main() -> Result<()> {
    tonic_build::compile_protos("src/proto/pool.proto")?;

    Ok(())
}
