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

use std::env;

const DEFAULT_WORKER_COUNT: usize = 2;

/// Enum for supported configuration parameters.
#[derive(Debug)]
pub enum Config {
    Workers,
    LogFormat,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::Workers => "DEPLOYCONTROL_WORKERS",
            Config::LogFormat => "DEPLOYCONTROL_LOG_FORMAT",
        }
    }

    /// Returns the default value used when the environment variable is unset.
    pub fn default_value(&self) -> &'static str {
        match self {
            Config::Workers => "2",
            Config::LogFormat => "text",
        }
    }

    /// Resolves the parameter from the environment, falling back to the default.
    pub fn resolve(&self) -> String {
        env::var(self.env_var()).unwrap_or_else(|_| self.default_value().to_string())
    }
}

/// Number of parallel reconcile workers the supervisor should launch.
///
/// Invalid or zero values fall back to the built-in default rather than
/// erroring out at startup.
pub fn worker_count() -> usize {
    Config::Workers
        .resolve()
        .parse::<usize>()
        .ok()
        .filter(|count| *count > 0)
        .unwrap_or(DEFAULT_WORKER_COUNT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    fn env_lock() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .expect("env lock poisoned")
    }

    #[test]
    fn worker_count_defaults_when_unset() {
        let _guard = env_lock();
        env::remove_var(Config::Workers.env_var());
        assert_eq!(worker_count(), DEFAULT_WORKER_COUNT);
    }

    #[test]
    fn worker_count_reads_environment() {
        let _guard = env_lock();
        env::set_var(Config::Workers.env_var(), "5");
        assert_eq!(worker_count(), 5);
        env::remove_var(Config::Workers.env_var());
    }

    #[test]
    fn worker_count_rejects_invalid_values() {
        let _guard = env_lock();
        env::set_var(Config::Workers.env_var(), "0");
        assert_eq!(worker_count(), DEFAULT_WORKER_COUNT);
        env::set_var(Config::Workers.env_var(), "not-a-number");
        assert_eq!(worker_count(), DEFAULT_WORKER_COUNT);
        env::remove_var(Config::Workers.env_var());
    }
}
