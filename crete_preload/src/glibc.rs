use std::ffi::{CStr, c_char, c_int, c_void};

type MainFn = unsafe extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char) -> c_int;
type InitFn = Option<unsafe extern "C" fn()>;
type LibcStartMain = unsafe extern "C" fn(
    MainFn,
    c_int,
    *mut *mut c_char,
    InitFn,
    InitFn,
    InitFn,
    *mut c_void,
) -> c_int;

/// Collects the arguments the loader handed to the process.
///
/// # Safety
/// `argv` must point to `argc` valid NUL-terminated strings.
unsafe fn collect_args(argc: c_int, argv: *mut *mut c_char) -> Vec<Vec<u8>> {
    (0..argc.max(0) as usize)
        .map(|i| {
            // SAFETY: guaranteed by the caller.
            unsafe { CStr::from_ptr(*argv.add(i)) }.to_bytes().to_vec()
        })
        .collect()
}

/// Hands the rewritten arguments to the process for good, as a
/// NULL-terminated pointer array.
fn leak_args(args: Vec<Box<[u8]>>) -> (c_int, *mut *mut c_char) {
    let mut pointers: Vec<*mut c_char> = args
        .into_iter()
        .map(|arg| Box::leak(arg).as_mut_ptr().cast::<c_char>())
        .collect();
    let argc = pointers.len() as c_int;
    pointers.push(std::ptr::null_mut());
    (argc, Box::leak(pointers.into_boxed_slice()).as_mut_ptr())
}

/// # Safety
/// Called by the dynamic loader in place of glibc's own entry with the
/// arguments it would have passed there.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __libc_start_main(
    main: MainFn,
    argc: c_int,
    argv: *mut *mut c_char,
    init: InitFn,
    fini: InitFn,
    rtld_fini: InitFn,
    stack_end: *mut c_void,
) -> c_int {
    // SAFETY: RTLD_NEXT lookup of a NUL-terminated symbol name.
    let real = unsafe { libc::dlsym(libc::RTLD_NEXT, c"__libc_start_main".as_ptr()) };
    if real.is_null() {
        eprintln!("[crete] failed to find __libc_start_main");
        std::process::exit(1);
    }
    // SAFETY: the symbol found is glibc's __libc_start_main, which has this signature.
    let real: LibcStartMain = unsafe { std::mem::transmute(real) };

    // SAFETY: the loader passes a valid argv of argc entries.
    let original = unsafe { collect_args(argc, argv) };
    let (argc, argv) = match crate::prepare(original) {
        Some(rewritten) => leak_args(rewritten),
        None => (argc, argv),
    };

    // SAFETY: forwarding the loader's arguments, with argv possibly replaced
    // by a leaked array that lives for the rest of the process.
    unsafe { real(main, argc, argv, init, fini, rtld_fini, stack_end) }
}
