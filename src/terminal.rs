#[cfg(unix)]
mod unix {
    pub fn use_fancy() -> bool {
        unsafe {
            libc::isatty(/* stdout */ 1) == 1
        }
    }

    pub fn get_cols() -> Option<usize> {
        unsafe {
            let mut winsize = std::mem::zeroed::<libc::winsize>();
            if libc::ioctl(0, libc::TIOCGWINSZ, &mut winsize) < 0 {
                return None;
            }
            if winsize.ws_col < 10 {
                // Ignore too-narrow widths; whatever is reporting them is
                // likely confused, and our progress would be unreadable.
                return None;
            }
            Some(winsize.ws_col as usize)
        }
    }
}

#[cfg(unix)]
pub use unix::*;

#[cfg(windows)]
mod windows {
    use windows_sys::Win32::System::Console::{
        GetConsoleMode, GetConsoleScreenBufferInfo, GetStdHandle, CONSOLE_SCREEN_BUFFER_INFO,
        STD_OUTPUT_HANDLE,
    };

    pub fn use_fancy() -> bool {
        unsafe {
            let handle = GetStdHandle(STD_OUTPUT_HANDLE);
            let mut mode = 0;
            // GetConsoleMode itself fails when not attached to a console.
            GetConsoleMode(handle, &mut mode) != 0
        }
    }

    pub fn get_cols() -> Option<usize> {
        unsafe {
            let console = GetStdHandle(STD_OUTPUT_HANDLE);
            let mut csbi = std::mem::zeroed::<CONSOLE_SCREEN_BUFFER_INFO>();
            if GetConsoleScreenBufferInfo(console, &mut csbi) == 0 {
                return None;
            }
            if csbi.dwSize.X < 10 {
                return None;
            }
            Some(csbi.dwSize.X as usize)
        }
    }
}

#[cfg(windows)]
pub use windows::*;
