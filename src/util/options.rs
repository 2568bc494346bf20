use crate::util::constants::BYTES_IN_MBYTE;
use std::default::Default;

fn always_valid<T>(_: &T) -> bool {
    true
}

macro_rules! options {
    ($($name:ident: $type:ty[$validator:expr] = $default:expr),*,) => [
        options!($($name: $type[$validator] = $default),*);
    ];
    ($($name:ident: $type:ty[$validator:expr] = $default:expr),*) => [
        /// Runtime options of a process heap.
        #[derive(Clone, Debug)]
        pub struct Options {
            $(pub $name: $type),*
        }
        impl Options {
            /// Set an option from its string form. Returns false and keeps the old value if the
            /// value cannot be parsed or is rejected by the validator.
            pub fn set_from_str(&mut self, s: &str, val: &str)->bool {
                match s {
                    // Parse the given value from str (by env vars or by calling set_from_str()) to the right type
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        // Validate
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            // Only set value if valid.
                            self.$name = val.clone();
                        } else {
                            eprintln!("Warn: unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        eprintln!("Warn: unable to set {}={:?}. Cant parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => panic!("Invalid Options key: {}", s)
                }
            }

            /// Options with their built-in defaults, ignoring the environment.
            pub fn builtin() -> Self {
                Options {
                    $($name: $default),*
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                let mut options = Options::builtin();

                // If we have env vars that start with THREADHEAP_ and match any option (such as THREADHEAP_GC_THRESHOLD),
                // we set the option to its value (if it is a valid value). Otherwise, use the default value.
                const PREFIX: &str = "THREADHEAP_";
                for (key, val) in std::env::vars() {
                    // strip the prefix, and get the lower case string
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { options.set_from_str(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
                options
            }
        }
    ]
}

options! {
    // Number of entries in one block of a callback stack.
    callback_stack_block_size:     usize [|v: &usize| *v > 0]                  = 8192,
    // log2 of the number of entries in the heap-does-not-contain cache. Entries are grouped in pairs.
    containment_cache_log_entries: u8    [|v: &u8| *v >= 1 && *v <= 20]       = 12,
    // Allocated bytes since the last collection before a collection is requested.
    gc_threshold:                  usize [always_valid]                        = BYTES_IN_MBYTE,
    // The heap must have grown by this factor since the last collection before a collection is requested.
    heap_growing_rate:             f64   [|v: &f64| *v >= 1.0]                 = 1.5,
    // Upper bound on the collections run for a terminating thread.
    termination_gc_iterations:     usize [|v: &usize| *v > 0]                  = 5,
}
