#![allow(unused_macros)]

macro_rules! cfg_dtls {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "dtls")]
            #[cfg_attr(docsrs, doc(cfg(feature = "dtls")))]
            $item
        )*
    }
}

macro_rules! cfg_not_dtls {
    ($($item:item)*) => {
        $(
            #[cfg(not(feature = "dtls"))]
            $item
        )*
    }
}
