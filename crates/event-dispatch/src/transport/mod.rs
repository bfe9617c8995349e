// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transports shipped with the dispatch core.

mod line;

pub use line::LineClient;
