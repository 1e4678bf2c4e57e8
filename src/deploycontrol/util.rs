/*
 * Copyright (C) 2024 The Deploycontrol Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

/// Resolves an optional namespace to the effective namespace string.
pub fn normalize_namespace(namespace: Option<&str>) -> String {
    namespace
        .filter(|ns| !ns.is_empty())
        .unwrap_or("default")
        .to_string()
}

/// Renders the canonical `namespace/name` cache key used by the work queues.
pub fn namespace_key(namespace: Option<&str>, name: &str) -> String {
    format!("{}/{}", normalize_namespace(namespace), name)
}

/// Splits a `namespace/name` key back into its parts.
///
/// Keys with a missing namespace or name, or with extra separators, are
/// rejected; the queues only ever carry keys produced by [`namespace_key`].
pub fn split_namespace_key(key: &str) -> Option<(String, String)> {
    let mut parts = key.splitn(2, '/');
    let namespace = parts.next().filter(|ns| !ns.is_empty())?;
    let name = parts.next().filter(|name| !name.is_empty())?;
    if name.contains('/') {
        return None;
    }
    Some((namespace.to_string(), name.to_string()))
}
