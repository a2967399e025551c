// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod connection;
pub mod daemon;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod settings;
