use nom::IResult;
use nom::bytes::complete::take_while;
use nom::error::ParseError;

/// Tuple of parsers which are applied in sequence with leading
/// whitespace skipped before each one
pub trait WsTuple<'i, O, E> {
    fn parse(&mut self, i: &'i str) -> IResult<&'i str, O, E>;
}

/// Take a list of parsers and insert a take_while(whitespace) before each
#[inline]
pub fn ws<'i, O, E, L>(mut l: L) -> impl FnMut(&'i str) -> IResult<&'i str, O, E>
where
    E: ParseError<&'i str>,
    L: WsTuple<'i, O, E>,
{
    move |i| l.parse(i)
}

fn whitespace(c: char) -> bool {
    c.is_ascii_whitespace()
}

macro_rules! ws_impl {
    (
        $gen:ident $gen_fn:ident;
        $($r_gen:ident $r_gen_fn:ident;)*
    ) => {
        ws_impl!(
            @impl_
            $gen $gen_fn;
            $($r_gen $r_gen_fn;)*
        );

        ws_impl!(
            $($r_gen $r_gen_fn;)*
        );
    };
    (@impl_ $($gen:ident $gen_fn:ident;)+) => {
        impl<
            'i,
            $($gen,)*
            Error: ParseError<&'i str>,
            $(
                $gen_fn: FnMut(&'i str) -> IResult<&'i str, $gen, Error>,
            )*
            >
            WsTuple<'i, ($($gen,)*), Error> for ($($gen_fn,)*)
            {
                #[allow(non_snake_case)]
                fn parse(&mut self, input: &'i str) -> IResult<&'i str, ( $($gen,)* ), Error> {
                    let ($($gen_fn,)*) = self;

                    $(
                    let (input, _) = take_while(whitespace)(input)?;
                    let (input, $gen) = ($gen_fn)(input)?;
                    )*

                    Ok((input, ($($gen,)*)))
                }
            }
    };
    () => {};
}

ws_impl! {
    A FnA;
    B FnB;
    C FnC;
    D FnD;
    E FnE;
    F FnF;
    G FnG;
    H FnH;
}
