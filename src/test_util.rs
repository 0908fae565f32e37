// Copyright © 2025 Cyberus Technology GmbH
// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//
